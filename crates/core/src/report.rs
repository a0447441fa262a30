// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::metrics::MetricsSummary;
use crate::{HarnessResult, StopReason};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail { reason: String },
    Error { message: String },
}

impl CaseStatus {
    /// Console label, `PASS`, `FAIL` or `ERR`.
    pub fn label(&self) -> &'static str {
        match self {
            CaseStatus::Pass => "PASS",
            CaseStatus::Fail { .. } => "FAIL",
            CaseStatus::Error { .. } => "ERR",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            CaseStatus::Pass => None,
            CaseStatus::Fail { reason } => Some(reason),
            CaseStatus::Error { message } => Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    #[serde(flatten)]
    pub status: CaseStatus,
    pub stop_reason: Option<StopReason>,
    pub steps: u64,
    pub output: String,
    pub duration_ms: u64,
    pub metrics: MetricsSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub results: Vec<CaseResult>,
    pub snapshot_digest: String,
    pub duration_ms: u64,
}

impl SuiteReport {
    pub fn new(results: Vec<CaseResult>, snapshot_digest: String, duration_ms: u64) -> Self {
        Self {
            results,
            snapshot_digest,
            duration_ms,
        }
    }

    fn count(&self, f: impl Fn(&CaseStatus) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.status)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Pass))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Fail { .. }))
    }

    pub fn errored(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Error { .. }))
    }

    pub fn failing_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.status != CaseStatus::Pass)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() + self.errored() == 0 {
            0
        } else {
            1
        }
    }

    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_junit(&self, suite_name: &str) -> String {
        let mut xml = String::new();
        let _ = writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        let _ = writeln!(
            xml,
            r#"<testsuite name="{}" tests="{}" failures="{}" errors="{}" time="{:.3}">"#,
            xml_escape(suite_name),
            self.results.len(),
            self.failed(),
            self.errored(),
            self.duration_ms as f64 / 1000.0
        );
        for r in &self.results {
            let _ = write!(
                xml,
                r#"  <testcase classname="{}" name="{}" time="{:.3}""#,
                xml_escape(suite_name),
                xml_escape(&r.name),
                r.duration_ms as f64 / 1000.0
            );
            match &r.status {
                CaseStatus::Pass => {
                    let _ = writeln!(xml, "/>");
                }
                CaseStatus::Fail { reason } => {
                    let _ = writeln!(xml, ">");
                    let _ = writeln!(
                        xml,
                        r#"    <failure message="{}"/>"#,
                        xml_escape(reason)
                    );
                    let _ = writeln!(xml, "  </testcase>");
                }
                CaseStatus::Error { message } => {
                    let _ = writeln!(xml, ">");
                    let _ = writeln!(
                        xml,
                        r#"    <error message="{}"/>"#,
                        xml_escape(message)
                    );
                    let _ = writeln!(xml, "  </testcase>");
                }
            }
        }
        let _ = writeln!(xml, "</testsuite>");
        xml
    }

    pub fn write_junit(&self, path: &Path, suite_name: &str) -> HarnessResult<()> {
        std::fs::write(path, self.to_junit(suite_name))?;
        Ok(())
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            c => out.push(c),
        }
    }
    out
}
