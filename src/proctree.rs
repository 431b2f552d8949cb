//! Process table snapshots and descendant walking.
//!
//! The supervisor only ever needs parent links, names and run states, so a
//! snapshot is a flat list read from `/proc` and trees are rebuilt on demand.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

/// Kernel limit on `comm` (TASK_COMM_LEN - 1).
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    Zombie,
    Dead,
    Other(char),
}

impl ProcessState {
    pub fn from_stat_char(c: char) -> Self {
        match c {
            'R' => ProcessState::Running,
            'S' | 'I' => ProcessState::Sleeping,
            'D' => ProcessState::DiskSleep,
            'T' | 't' => ProcessState::Stopped,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Dead,
            other => ProcessState::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    /// Base name of `/proc/<pid>/exe`, when readable.
    pub exe_name: Option<String>,
    pub state: ProcessState,
}

/// Source of process table snapshots.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> std::io::Result<Vec<ProcessInfo>>;
}

/// Process table backed by `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFs;

impl ProcessTable for ProcFs {
    #[cfg(target_os = "linux")]
    fn snapshot(&self) -> std::io::Result<Vec<ProcessInfo>> {
        let mut processes = Vec::with_capacity(256);

        for entry in std::fs::read_dir("/proc")?.flatten() {
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };

            // Processes vanish between readdir and read; skip them.
            let stat = match std::fs::read_to_string(entry.path().join("stat")) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let Some(mut info) = parse_stat(&stat) else {
                tracing::debug!(pid, "unparseable /proc stat line");
                continue;
            };
            info.exe_name = std::fs::read_link(entry.path().join("exe"))
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
            processes.push(info);
        }

        Ok(processes)
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&self) -> std::io::Result<Vec<ProcessInfo>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process table snapshots are only supported on Linux",
        ))
    }
}

/// Parse `/proc/<pid>/stat`: `pid (comm) state ppid ...`.
///
/// `comm` may itself contain spaces and parentheses, so split on the last `)`.
pub fn parse_stat(line: &str) -> Option<ProcessInfo> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    let pid = line[..open].trim().parse().ok()?;
    let comm = line[open + 1..close].to_string();
    let mut rest = line[close + 1..].split_whitespace();
    let state = ProcessState::from_stat_char(rest.next()?.chars().next()?);
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcessInfo {
        pid,
        ppid,
        comm,
        exe_name: None,
        state,
    })
}

/// All descendants of `root` in breadth-first order (children before grandchildren).
pub fn descendants(processes: &[ProcessInfo], root: u32) -> Vec<ProcessInfo> {
    let mut children: HashMap<u32, Vec<&ProcessInfo>> = HashMap::new();
    for p in processes {
        if p.pid != p.ppid {
            children.entry(p.ppid).or_default().push(p);
        }
    }

    let mut result = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                result.push((*kid).clone());
                queue.push_back(kid.pid);
            }
        }
    }
    result
}

/// Whether a process is an instance of `binary`, compared by base name.
pub fn matches_binary(process: &ProcessInfo, binary: &Path) -> bool {
    let Some(base) = binary.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    let truncated: String = base.chars().take(COMM_LEN).collect();

    process.comm == truncated || process.exe_name.as_deref() == Some(base.as_ref())
}
