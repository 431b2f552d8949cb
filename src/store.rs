//! Append-only CSV result files.
//!
//! The header is written once, when the file is created (or found empty).
//! Every row is written and flushed under an exclusive advisory lock, so an
//! interrupt can only ever lose whole rows.

use crate::metrics::{MetricRecord, Role};
use chrono::{DateTime, Local};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TIMING_COLUMNS: [&str; 3] = ["time_elapsed_s", "user_time_s", "sys_time_s"];

#[derive(Debug)]
pub enum StoreError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: csv::Error,
    },
    /// The existing file was written with a different column set.
    HeaderMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Open { path, source } => {
                write!(f, "failed to open result file {}: {source}", path.display())
            }
            StoreError::Lock { path, source } => {
                write!(f, "failed to lock result file {}: {source}", path.display())
            }
            StoreError::Write { path, source } => {
                write!(f, "failed to write result file {}: {source}", path.display())
            }
            StoreError::HeaderMismatch {
                path,
                expected,
                found,
            } => write!(
                f,
                "result file {} has columns [{}], this run records [{}]",
                path.display(),
                found.join(","),
                expected.join(",")
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Open { source, .. } => Some(source),
            StoreError::Lock { source, .. } => Some(source),
            StoreError::Write { source, .. } => Some(source),
            StoreError::HeaderMismatch { .. } => None,
        }
    }
}

/// Result file for one role.
#[derive(Debug)]
pub struct ResultStore {
    path: PathBuf,
    counters: Vec<String>,
    file: Mutex<File>,
    existing_rows: u64,
}

impl ResultStore {
    /// Open `path` for appending, writing the header if the file is new or empty.
    pub fn open(path: &Path, counters: &[String]) -> Result<Self, StoreError> {
        let open_err = |e| StoreError::Open {
            path: path.to_path_buf(),
            source: e,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(open_err)?;

        let store = Self {
            path: path.to_path_buf(),
            counters: counters.to_vec(),
            file: Mutex::new(file),
            existing_rows: 0,
        };
        store.with_lock(|file| {
            let len = file.metadata().map_err(csv::Error::from)?.len();
            if len == 0 {
                write_row(file, store.header())?;
                tracing::debug!(path = %store.path.display(), "wrote result header");
            }
            Ok(())
        })?;

        if let Some(found) = read_header(path).map_err(open_err)? {
            let expected = store.header();
            if found != expected {
                return Err(StoreError::HeaderMismatch {
                    path: path.to_path_buf(),
                    expected,
                    found,
                });
            }
        }

        let existing_rows = count_data_rows(path).map_err(open_err)?;
        if existing_rows > 0 {
            tracing::info!(
                path = %path.display(),
                existing_rows,
                "resuming existing result file"
            );
        }
        Ok(Self {
            existing_rows,
            ..store
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows already present when the file was opened.
    pub fn existing_rows(&self) -> u64 {
        self.existing_rows
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["iteration".to_string(), "timestamp".to_string()];
        header.extend(self.counters.iter().cloned());
        header.extend(TIMING_COLUMNS.iter().map(|s| s.to_string()));
        header.push("status".to_string());
        header
    }

    /// Append one record as a full row in the declared column order.
    pub fn append(&self, record: &MetricRecord) -> Result<(), StoreError> {
        let row = self.row(record);
        self.with_lock(|file| write_row(file, row))?;
        tracing::debug!(
            path = %self.path.display(),
            iteration = record.iteration,
            "appended result row"
        );
        Ok(())
    }

    fn row(&self, record: &MetricRecord) -> Vec<String> {
        let mut row = vec![
            record.iteration.to_string(),
            record
                .timestamp
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        ];
        for name in &self.counters {
            let value = record
                .counters
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| "0".to_string());
            row.push(value);
        }
        for value in [record.timing.elapsed, record.timing.user, record.timing.sys] {
            row.push(value.map(|v| v.to_string()).unwrap_or_default());
        }
        row.push(record.status.as_str().to_string());
        row
    }

    fn with_lock<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut File) -> Result<(), csv::Error>,
    {
        // A poisoned lock only means another append panicked mid-call; the
        // file handle itself is still usable.
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.lock_exclusive().map_err(|e| StoreError::Lock {
            path: self.path.clone(),
            source: e,
        })?;
        let result = f(&mut *file);
        let _ = FileExt::unlock(&*file);
        result.map_err(|e| StoreError::Write {
            path: self.path.clone(),
            source: e,
        })
    }
}

fn write_row(file: &mut File, row: Vec<String>) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(&row)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    // One write call per row keeps O_APPEND writes whole.
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

fn read_header(path: &Path) -> std::io::Result<Option<Vec<String>>> {
    let mut first = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first)?;
    let first = first.trim_end();
    if first.is_empty() {
        return Ok(None);
    }
    Ok(Some(first.split(',').map(|s| s.to_string()).collect()))
}

fn count_data_rows(path: &Path) -> std::io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = 0u64;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            lines += 1;
        }
    }
    Ok(lines.saturating_sub(1))
}

/// `{results_dir}/{hostname}-{YYYYmmdd-HHMMSS}-{role}-{label}.csv`
pub fn output_path(results_dir: &Path, role: Role, label: &str, now: DateTime<Local>) -> PathBuf {
    let hostname = nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|| "localhost".to_string());
    let timestamp = now.format("%Y%m%d-%H%M%S");
    results_dir.join(format!("{hostname}-{timestamp}-{role}-{label}.csv"))
}

/// File label: base name of the server's `-f` config file, else the test
/// name, else `generic`.
pub fn output_label(config_file: Option<&str>, test_name: Option<&str>) -> String {
    config_file
        .and_then(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .or_else(|| test_name.map(|s| s.to_string()))
        .unwrap_or_else(|| "generic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CounterValue, DerivedTiming, SampleStatus};
    use chrono::TimeZone;

    fn counters() -> Vec<String> {
        vec!["cycles".to_string(), "instructions".to_string()]
    }

    fn record(iteration: u64) -> MetricRecord {
        MetricRecord {
            iteration,
            role: Role::Client,
            timestamp: None,
            counters: vec![
                ("cycles".to_string(), CounterValue::Int(1000 + iteration)),
                ("instructions".to_string(), CounterValue::Int(2000)),
            ],
            timing: DerivedTiming {
                elapsed: Some(0.25),
                user: None,
                sys: None,
            },
            status: SampleStatus::Complete,
        }
    }

    #[test]
    fn test_header_written_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let store = ResultStore::open(&path, &counters()).unwrap();
        store.append(&record(0)).unwrap();
        drop(store);

        let store = ResultStore::open(&path, &counters()).unwrap();
        assert_eq!(store.existing_rows(), 1);
        store.append(&record(1)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "iteration,timestamp,cycles,instructions,time_elapsed_s,user_time_s,sys_time_s,status"
        );
        assert_eq!(lines[1], "0,,1000,2000,0.25,,,ok");
        assert_eq!(lines[2], "1,,1001,2000,0.25,,,ok");
        assert_eq!(contents.matches("iteration").count(), 1);
    }

    #[test]
    fn test_fresh_file_has_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/results.csv");
        let store = ResultStore::open(&path, &counters()).unwrap();
        assert_eq!(store.existing_rows(), 0);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn test_empty_existing_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        std::fs::write(&path, "").unwrap();
        ResultStore::open(&path, &counters()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("iteration,"));
    }

    #[test]
    fn test_reopen_with_different_counters_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultStore::open(&path, &counters()).unwrap();
        store.append(&record(0)).unwrap();
        drop(store);
        let before = std::fs::read_to_string(&path).unwrap();

        let other = vec!["cycles".to_string(), "cache-misses".to_string()];
        let err = ResultStore::open(&path, &other).unwrap_err();
        match &err {
            StoreError::HeaderMismatch {
                expected, found, ..
            } => {
                assert_eq!(found[3], "instructions");
                assert_eq!(expected[3], "cache-misses");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("cache-misses"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_missing_counter_recorded_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultStore::open(&path, &counters()).unwrap();
        let mut rec = record(0);
        rec.counters.truncate(1);
        rec.status = SampleStatus::Aborted;
        store.append(&rec).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().nth(1).unwrap(), "0,,1000,0,0.25,,,aborted");
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = std::sync::Arc::new(ResultStore::open(&path, &counters()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        store.append(&record(i * 100 + j)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 201);
        for line in &lines[1..] {
            assert_eq!(line.split(',').count(), 8, "malformed row: {line}");
        }
    }

    #[test]
    fn test_timestamp_column_is_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultStore::open(&path, &counters()).unwrap();
        let mut rec = record(0);
        rec.timestamp = Some(Local.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        store.append(&rec).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let ts = contents.lines().nth(1).unwrap().split(',').nth(1).unwrap();
        assert!(ts.starts_with("2025-03-01T12:00:00"));
    }

    #[test]
    fn test_open_failure() {
        let err = ResultStore::open(Path::new("/proc/nonexistent/results.csv"), &counters())
            .unwrap_err();
        assert!(matches!(err, StoreError::Open { .. }));
    }

    #[test]
    fn test_output_label() {
        assert_eq!(
            output_label(Some("/root/experiment/sshd_config/sshd_config_t_rsa_2048"), Some("T")),
            "sshd_config_t_rsa_2048"
        );
        assert_eq!(output_label(None, Some("Test-RSA-2048")), "Test-RSA-2048");
        assert_eq!(output_label(None, None), "generic");
    }

    #[test]
    fn test_output_path_format() {
        let now = Local.with_ymd_and_hms(2025, 3, 1, 9, 5, 7).unwrap();
        let path = output_path(Path::new("Results"), Role::Server, "generic", now);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(path.starts_with("Results"));
        assert!(name.ends_with("-20250301-090507-server-generic.csv"), "{name}");
    }
}
