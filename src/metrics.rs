//! Counter extraction from the wrapper's diagnostic text.
//!
//! `perf stat` writes its summary to stderr in a format that drifts between
//! versions and locales, interleaved with whatever the measured program logs.
//! Parsing is lenient: unknown lines are skipped and unparseable values
//! become zero, so a single odd line never loses a whole sample.

use chrono::{DateTime, Local};
use regex::Regex;
use std::sync::LazyLock;

/// `<value> <name>` at the start of a line. The value is either a number
/// with `,`/`.` separators or one of perf's placeholders.
static COUNTER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(<not counted>|<not supported>|[0-9][0-9.,]*|\S+)\s+([A-Za-z][A-Za-z0-9_\-:/]*)")
        .unwrap()
});

/// `<value> seconds time elapsed|user|sys`.
static TIMING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([0-9][0-9.,]*)\s+seconds\s+(time elapsed|user|sys)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    Int(u64),
    Float(f64),
}

impl Default for CounterValue {
    fn default() -> Self {
        CounterValue::Int(0)
    }
}

impl std::fmt::Display for CounterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterValue::Int(v) => write!(f, "{v}"),
            CounterValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Timing fields taken from perf's free-text summary lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedTiming {
    pub elapsed: Option<f64>,
    pub user: Option<f64>,
    pub sys: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Complete,
    /// The wrapper exited before a stop signal was observed.
    Aborted,
}

impl SampleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleStatus::Complete => "ok",
            SampleStatus::Aborted => "aborted",
        }
    }
}

/// Result of parsing one blob of wrapper output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCounters {
    /// One entry per declared counter, in declaration order.
    pub counters: Vec<(String, CounterValue)>,
    pub timing: DerivedTiming,
}

impl ParsedCounters {
    pub fn get(&self, name: &str) -> Option<CounterValue> {
        self.counters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// One measurement sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub iteration: u64,
    pub role: Role,
    pub timestamp: Option<DateTime<Local>>,
    pub counters: Vec<(String, CounterValue)>,
    pub timing: DerivedTiming,
    pub status: SampleStatus,
}

impl MetricRecord {
    pub fn new(iteration: u64, role: Role, parsed: ParsedCounters, status: SampleStatus) -> Self {
        Self {
            iteration,
            role,
            timestamp: Some(Local::now()),
            counters: parsed.counters,
            timing: parsed.timing,
            status,
        }
    }
}

/// Parses counter-tool text against the run's declared counter list.
#[derive(Debug, Clone)]
pub struct MetricsExtractor {
    counters: Vec<String>,
}

impl MetricsExtractor {
    pub fn new(counters: &[String]) -> Self {
        Self {
            counters: counters.to_vec(),
        }
    }

    /// Parse wrapper output. Never fails; anything not found stays at zero/absent.
    pub fn parse(&self, text: &str) -> ParsedCounters {
        let mut values: Vec<CounterValue> = vec![CounterValue::default(); self.counters.len()];
        let mut timing = DerivedTiming::default();

        for line in text.lines() {
            if let Some(caps) = TIMING_LINE.captures(line) {
                let value = parse_decimal(&caps[1]);
                match &caps[2] {
                    "time elapsed" => timing.elapsed = value,
                    "user" => timing.user = value,
                    "sys" => timing.sys = value,
                    _ => {}
                }
                continue;
            }

            let Some(caps) = COUNTER_LINE.captures(line) else {
                continue;
            };
            let Some(idx) = self.counter_index(&caps[2]) else {
                continue;
            };
            values[idx] = parse_counter_value(&caps[1]).unwrap_or_else(|| {
                tracing::debug!(line, "unparseable counter value, recording zero");
                CounterValue::default()
            });
        }

        ParsedCounters {
            counters: self.counters.iter().cloned().zip(values).collect(),
            timing,
        }
    }

    /// Declared counter matching `name`, ignoring perf's `:u`/`:k` modifiers.
    fn counter_index(&self, name: &str) -> Option<usize> {
        let base = name.split(':').next().unwrap_or(name);
        self.counters
            .iter()
            .position(|c| c == name)
            .or_else(|| self.counters.iter().position(|c| c == base))
    }
}

/// Parse a counter token where `,` groups thousands and `.` is the decimal point.
///
/// A token with more than one `.` is a dot-grouped integer (e.g. `1.234.567`).
fn parse_counter_value(token: &str) -> Option<CounterValue> {
    let cleaned = token.replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.matches('.').count() > 1 {
        return cleaned.replace('.', "").parse().ok().map(CounterValue::Int);
    }
    if let Ok(v) = cleaned.parse::<u64>() {
        return Some(CounterValue::Int(v));
    }
    cleaned.parse::<f64>().ok().map(CounterValue::Float)
}

/// Parse a seconds value from a timing line. A lone `,` is a decimal comma.
fn parse_decimal(token: &str) -> Option<f64> {
    let normalized = if token.contains(',') && !token.contains('.') {
        token.replacen(',', ".", 1)
    } else {
        token.replace(',', "")
    };
    normalized.parse().ok()
}
