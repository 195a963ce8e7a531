//! Structured emission of step results.
//!
//! Every reconcile step and health check lands in the sink: appended as a
//! JSON line to a per-run report file under the data directory, mirrored to
//! the console, or printed as JSON on stdout in machine mode. The in-memory
//! record list keeps its append order.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::{CheckResult, CheckStatus};
use crate::platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    /// The step found nothing to do; informational, not a failure.
    AlreadySatisfied,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Stamps a step's start and produces the finished record.
pub struct StepTimer {
    step: String,
    started_at: DateTime<Utc>,
    instant: Instant,
}

impl StepTimer {
    pub fn start(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            started_at: Utc::now(),
            instant: Instant::now(),
        }
    }

    pub fn finish(self, status: StepStatus, detail: Option<String>) -> StepRecord {
        StepRecord {
            step: self.step,
            status,
            started_at: self.started_at,
            duration_ms: self.instant.elapsed().as_millis() as u64,
            detail,
        }
    }
}

pub struct ReportSink {
    console: bool,
    machine: bool,
    file: Option<File>,
    records: Vec<StepRecord>,
}

impl ReportSink {
    /// Sink for a real run: report file plus console (or machine) output.
    /// A report file that cannot be created downgrades to a warning; the
    /// run itself must not depend on it.
    pub fn open(machine: bool) -> Self {
        let file = match create_report_file() {
            Ok((path, file)) => {
                debug!("writing report to {}", path.display());
                Some(file)
            }
            Err(error) => {
                warning!("no report file for this run: {error:#}");
                None
            }
        };
        Self {
            console: !machine,
            machine,
            file,
            records: Vec::new(),
        }
    }

    /// Silent in-memory sink.
    pub fn memory() -> Self {
        Self {
            console: false,
            machine: false,
            file: None,
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, record: StepRecord) {
        if let Ok(line) = serde_json::to_string(&record) {
            if let Some(file) = &mut self.file {
                writeln!(file, "{line}").ok();
            }
            if self.machine {
                println!("{line}");
            }
        }
        if self.console {
            let line = match &record.detail {
                Some(detail) => format!("{}: {:?} ({detail})", record.step, record.status),
                None => format!("{}: {:?}", record.step, record.status),
            };
            match record.status {
                StepStatus::Succeeded | StepStatus::AlreadySatisfied => success!("{line}"),
                StepStatus::Cancelled => warning!("{line}"),
                StepStatus::Failed => error!("{line}"),
            }
        }
        self.records.push(record);
    }

    pub fn record_check(&mut self, check: &CheckResult) {
        let status = match check.status {
            CheckStatus::Pass => StepStatus::Succeeded,
            CheckStatus::Fail | CheckStatus::Error => StepStatus::Failed,
            CheckStatus::Cancelled => StepStatus::Cancelled,
        };
        self.record(StepRecord {
            step: format!("check:{}", check.name),
            status,
            started_at: Utc::now(),
            duration_ms: check.latency_ms,
            detail: check.diagnostic.clone(),
        });
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }
}

fn create_report_file() -> Result<(PathBuf, File)> {
    let dir = platform::reports_dir();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create directory {dir:?}"))?;
    let name = format!(
        "run-{}-{}.jsonl",
        Utc::now().format("%Y%m%dT%H%M%S"),
        std::process::id()
    );
    let path = dir.join(name);
    let file = File::create(&path).with_context(|| format!("failed to create file {path:?}"))?;
    Ok((path, file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_keep_append_order() {
        let mut sink = ReportSink::memory();
        sink.record(StepTimer::start("provision-cluster").finish(StepStatus::Succeeded, None));
        sink.record(StepTimer::start("install-workload").finish(
            StepStatus::Failed,
            Some("chart not found".into()),
        ));

        let steps: Vec<_> = sink.records().iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["provision-cluster", "install-workload"]);
        assert_eq!(sink.records()[1].status, StepStatus::Failed);
    }

    #[test]
    fn step_records_serialize_as_single_json_lines() {
        let record = StepTimer::start("select-context").finish(StepStatus::Succeeded, None);
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""step":"select-context""#));
        assert!(line.contains(r#""status":"succeeded""#));
        // Detail is omitted entirely when there is none.
        assert!(!line.contains("detail"));
    }

    #[test]
    fn check_results_map_onto_step_records() {
        let mut sink = ReportSink::memory();
        sink.record_check(&CheckResult {
            name: "query-responds".into(),
            status: CheckStatus::Error,
            required: true,
            latency_ms: 12,
            diagnostic: Some("could not run \"kubectl\"".into()),
        });

        let record = &sink.records()[0];
        assert_eq!(record.step, "check:query-responds");
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.duration_ms, 12);
        assert!(record.detail.as_deref().unwrap().contains("kubectl"));
    }
}
