// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a pump stopped driving the guest.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Halted,
    /// Guest went idle and the host had no more input to give it.
    InputExhausted,
    BudgetExhausted,
    SentinelMatched,
    WallClockTimeout,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Halted => "halted",
            StopReason::InputExhausted => "input_exhausted",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::SentinelMatched => "sentinel_matched",
            StopReason::WallClockTimeout => "wall_clock_timeout",
        }
    }

    /// Budget or wall-clock exhaustion, as opposed to a signal from the guest.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StopReason::BudgetExhausted | StopReason::WallClockTimeout)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Raw image attached as-is.
    #[serde(default)]
    pub image: Option<String>,
    /// Script files appended (newline separated) after `image`.
    #[serde(default)]
    pub boot_files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    pub ram: String,     // e.g. "1MiB"
    pub ext_mem: String, // e.g. "16MiB"
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

impl MachineConfig {
    pub fn ram_bytes(&self) -> Result<u64> {
        parse_size(&self.ram).context("Invalid 'machine.ram' size")
    }

    pub fn ext_mem_bytes(&self) -> Result<u64> {
        parse_size(&self.ext_mem).context("Invalid 'machine.ext_mem' size")
    }

    /// Assemble the storage image, if any, from the configured files.
    pub fn storage_image(&self) -> Result<Option<Vec<u8>>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };

        let mut image = match &storage.image {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("Failed to read storage image at {:?}", path))?,
            None => Vec::new(),
        };

        for file in &storage.boot_files {
            let bytes = std::fs::read(file)
                .with_context(|| format!("Failed to read boot file at {:?}", file))?;
            if !image.is_empty() && !image.ends_with(b"\n") {
                image.push(b'\n');
            }
            image.extend_from_slice(&bytes);
        }

        Ok(Some(image))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Pre-provisioned host TAP interface, e.g. "bc64tap0".
    pub interface: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BootConfig {
    /// Console lines fed after the guest finishes booting from storage.
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default = "default_boot_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_boot_batch_size")]
    pub batch_size: u64,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            max_steps: default_boot_max_steps(),
            batch_size: default_boot_batch_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Command appended to every batch case. Empty disables it.
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

impl Default for TestLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            batch_size: default_batch_size(),
            terminator: default_terminator(),
        }
    }
}

/// Tick durations and batch sizes of the real-time pump.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RealtimeTuning {
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_idle_batch")]
    pub idle_batch: u64,
    #[serde(default = "default_run_batch")]
    pub run_batch: u64,
    #[serde(default = "default_grace_batches")]
    pub grace_batches: u32,
    #[serde(default = "default_grace_batch")]
    pub grace_batch: u64,
    #[serde(default = "default_grace_sleep_ms")]
    pub grace_sleep_ms: u64,
    #[serde(default = "default_realtime_max_steps")]
    pub max_steps: u64,
}

impl Default for RealtimeTuning {
    fn default() -> Self {
        Self {
            idle_sleep_ms: default_idle_sleep_ms(),
            idle_batch: default_idle_batch(),
            run_batch: default_run_batch(),
            grace_batches: default_grace_batches(),
            grace_batch: default_grace_batch(),
            grace_sleep_ms: default_grace_sleep_ms(),
            max_steps: default_realtime_max_steps(),
        }
    }
}

fn default_boot_max_steps() -> u64 {
    10_000_000_000
}
fn default_boot_batch_size() -> u64 {
    5_000_000
}
fn default_max_steps() -> u64 {
    50_000_000
}
fn default_batch_size() -> u64 {
    100_000
}
fn default_terminator() -> String {
    "BYE".to_string()
}
fn default_idle_sleep_ms() -> u64 {
    5
}
fn default_idle_batch() -> u64 {
    50_000
}
fn default_run_batch() -> u64 {
    500_000
}
fn default_grace_batches() -> u32 {
    50
}
fn default_grace_batch() -> u64 {
    100_000
}
fn default_grace_sleep_ms() -> u64 {
    1
}
fn default_realtime_max_steps() -> u64 {
    5_000_000_000
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Batch,
    Realtime,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OutputContainsAssertion {
    pub output_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OutputNotContainsAssertion {
    pub output_not_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OutputRegexAssertion {
    pub output_regex: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StopReasonAssertion {
    pub expected_stop_reason: StopReason,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TestAssertion {
    OutputContains(OutputContainsAssertion),
    OutputNotContains(OutputNotContainsAssertion),
    OutputRegex(OutputRegexAssertion),
    ExpectedStopReason(StopReasonAssertion),
}

impl TestAssertion {
    pub fn contains(text: impl Into<String>) -> Self {
        TestAssertion::OutputContains(OutputContainsAssertion {
            output_contains: text.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    pub name: String,
    /// Lines fed before the measured commands (definitions, fixtures).
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub sentinel: Option<String>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

impl TestCase {
    pub fn batch(name: impl Into<String>, commands: &[&str], expected: &str) -> Self {
        Self {
            name: name.into(),
            setup: Vec::new(),
            commands: commands.iter().map(|s| s.to_string()).collect(),
            mode: RunMode::Batch,
            timeout_ms: None,
            sentinel: None,
            assertions: vec![TestAssertion::contains(expected)],
        }
    }

    pub fn expected_stop_reason(&self) -> Option<StopReason> {
        self.assertions.iter().find_map(|a| match a {
            TestAssertion::ExpectedStopReason(s) => Some(s.expected_stop_reason),
            _ => None,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SuiteManifest {
    pub schema_version: String,
    pub machine: MachineConfig,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub limits: TestLimits,
    #[serde(default)]
    pub realtime: RealtimeTuning,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl SuiteManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open suite manifest at {:?}", path.as_ref()))?;
        let mut suite: Self =
            serde_yaml::from_reader(f).context("Failed to parse Suite Manifest YAML")?;
        suite.validate()?;

        let base = path
            .as_ref()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        suite.resolve_paths(&base);
        Ok(suite)
    }

    /// Rewrite relative storage paths so they are relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let Some(storage) = self.machine.storage.as_mut() else {
            return;
        };
        let resolve = |p: &mut String| {
            if Path::new(p.as_str()).is_relative() {
                *p = base.join(p.as_str()).to_string_lossy().into_owned();
            }
        };
        if let Some(image) = storage.image.as_mut() {
            resolve(image);
        }
        storage.boot_files.iter_mut().for_each(resolve);
    }

    pub fn needs_network(&self) -> bool {
        self.tests.iter().any(|t| t.mode == RunMode::Realtime)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.machine.ram_bytes()? == 0 {
            anyhow::bail!("'machine.ram' must be greater than zero");
        }
        self.machine.ext_mem_bytes()?;

        if self.boot.max_steps == 0 || self.boot.batch_size == 0 {
            anyhow::bail!("Boot 'max_steps' and 'batch_size' must be greater than zero");
        }

        if self.limits.max_steps == 0 {
            anyhow::bail!("Limit 'max_steps' must be greater than zero");
        }
        if self.limits.batch_size == 0 {
            anyhow::bail!("Limit 'batch_size' must be greater than zero");
        }

        if self.realtime.idle_batch == 0 || self.realtime.run_batch == 0 {
            anyhow::bail!("Realtime 'idle_batch' and 'run_batch' must be greater than zero");
        }

        let mut seen = HashSet::new();
        for test in &self.tests {
            if test.name.trim().is_empty() {
                anyhow::bail!("Test names cannot be empty");
            }
            if !seen.insert(test.name.as_str()) {
                anyhow::bail!("Duplicate test name '{}'", test.name);
            }
            test.validate()
                .with_context(|| format!("Invalid test '{}'", test.name))?;
        }

        if self.needs_network() && self.network.is_none() {
            anyhow::bail!("Realtime tests require a 'network' section naming the TAP interface");
        }
        if let Some(net) = &self.network {
            if net.interface.trim().is_empty() {
                anyhow::bail!("'network.interface' cannot be empty");
            }
        }

        Ok(())
    }
}

impl TestCase {
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            RunMode::Batch => {
                if self.sentinel.is_some() || self.timeout_ms.is_some() {
                    anyhow::bail!("'sentinel' and 'timeout_ms' only apply to realtime tests");
                }
            }
            RunMode::Realtime => {
                if self.timeout_ms.is_none() {
                    anyhow::bail!("Realtime tests need 'timeout_ms'");
                }
                if matches!(self.sentinel.as_deref(), Some("")) {
                    anyhow::bail!("'sentinel' cannot be empty");
                }
            }
        }

        for assertion in &self.assertions {
            if let TestAssertion::OutputRegex(r) = assertion {
                regex::Regex::new(&r.output_regex)
                    .with_context(|| format!("Invalid output_regex {:?}", r.output_regex))?;
            }
        }
        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    if let Ok(bytes) = size_str.trim().parse::<u64>() {
        return Ok(bytes);
    }
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_suite() {
        let yaml = r#"
schema_version: "1.0"
machine:
  ram: "64KiB"
  ext_mem: "1MiB"
network:
  interface: "bc64tap0"
limits:
  max_steps: 1000
tests:
  - name: "add"
    commands: ["2 2 + ."]
    assertions:
      - output_contains: "4"
      - expected_stop_reason: halted
  - name: "probe"
    mode: realtime
    timeout_ms: 5000
    sentinel: "received"
    commands: ["10 64 0 1 200 ARP-PROBE"]
    assertions:
      - output_regex: "[01] received"
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        assert!(suite.validate().is_ok());
        assert_eq!(suite.machine.ram_bytes().unwrap(), 64 * 1024);
        assert_eq!(suite.limits.max_steps, 1000);
        assert_eq!(suite.limits.terminator, "BYE");
        assert_eq!(suite.tests.len(), 2);
        assert_eq!(suite.tests[0].expected_stop_reason(), Some(StopReason::Halted));
        assert_eq!(suite.tests[1].mode, RunMode::Realtime);
        assert!(suite.needs_network());
        assert_eq!(suite.realtime, RealtimeTuning::default());
    }

    #[test]
    fn test_invalid_version() {
        let yaml = r#"
schema_version: "2.0"
machine:
  ram: "64KiB"
  ext_mem: "0"
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        let err = suite.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported schema_version"));
    }

    #[test]
    fn test_invalid_max_steps() {
        let yaml = r#"
schema_version: "1.0"
machine:
  ram: "64KiB"
  ext_mem: "0"
limits:
  max_steps: 0
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        let err = suite.validate().unwrap_err();
        assert!(err.to_string().contains("max_steps"));
    }

    #[test]
    fn test_realtime_requires_network() {
        let yaml = r#"
schema_version: "1.0"
machine:
  ram: "64KiB"
  ext_mem: "0"
tests:
  - name: "probe"
    mode: realtime
    timeout_ms: 100
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        let err = suite.validate().unwrap_err();
        assert!(err.to_string().contains("network"));
    }

    #[test]
    fn test_sentinel_rejected_in_batch_mode() {
        let yaml = r#"
schema_version: "1.0"
machine:
  ram: "64KiB"
  ext_mem: "0"
tests:
  - name: "add"
    sentinel: "done"
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        let err = format!("{:#}", suite.validate().unwrap_err());
        assert!(err.contains("only apply to realtime"));
    }

    #[test]
    fn test_bad_regex_rejected() {
        let yaml = r#"
schema_version: "1.0"
machine:
  ram: "64KiB"
  ext_mem: "0"
tests:
  - name: "re"
    assertions:
      - output_regex: "(unclosed"
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        let err = format!("{:#}", suite.validate().unwrap_err());
        assert!(err.contains("output_regex"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
schema_version: "1.0"
machine:
  ram: "64KiB"
  ext_mem: "0"
tests:
  - name: "same"
  - name: "same"
"#;
        let suite: SuiteManifest = serde_yaml::from_str(yaml).unwrap();
        let err = suite.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_parse_size_accepts_bare_bytes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("16MiB").unwrap(), 16 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_storage_image_concatenates_boot_files() {
        let dir = std::env::temp_dir().join("bootcache-config-storage");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(dir.join("a.fs"), "1 2 +").unwrap();
        std::fs::write(dir.join("b.fs"), "VARIABLE X\n").unwrap();

        let mut machine = MachineConfig {
            ram: "64KiB".into(),
            ext_mem: "0".into(),
            storage: Some(StorageConfig {
                image: None,
                boot_files: vec!["a.fs".into(), "b.fs".into()],
            }),
        };
        let mut suite = SuiteManifest {
            schema_version: "1.0".into(),
            machine: machine.clone(),
            network: None,
            boot: BootConfig::default(),
            limits: TestLimits::default(),
            realtime: RealtimeTuning::default(),
            tests: Vec::new(),
        };
        suite.resolve_paths(&dir);
        machine = suite.machine;

        let image = machine.storage_image().unwrap().unwrap();
        assert_eq!(image, b"1 2 +\nVARIABLE X\n");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
