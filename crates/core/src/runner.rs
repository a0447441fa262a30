// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Boot once, snapshot once, then restore a fresh machine for every test.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bootcache_config::{BootConfig, RunMode, TestAssertion, TestCase, TestLimits};

use crate::cpu::StackMonitor;
use crate::decoder::decode_output;
use crate::metrics::PerformanceMetrics;
use crate::realtime::{RealtimeConfig, RealtimePump};
use crate::report::{CaseResult, CaseStatus, SuiteReport};
use crate::scheduler::{ExecutionOutcome, PendingInput, StepScheduler};
use crate::snapshot::MachineSnapshot;
use crate::{Cpu, Guest, HarnessError, HarnessResult, Machine, MachineBlueprint, NicBackend};
use crate::{SimResult, StopReason};

/// Produces the NIC backend for each real-time case.
pub type BackendFactory = Box<dyn Fn() -> HarnessResult<NicBackend>>;

/// Result of the one expensive boot.
#[derive(Debug, Clone)]
pub struct BootReport {
    pub snapshot: Arc<MachineSnapshot>,
    pub transcript: String,
    pub outcome: ExecutionOutcome,
}

impl BootReport {
    /// The last `n` lines the guest printed while booting.
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let lines: Vec<&str> = self.transcript.lines().collect();
        lines[lines.len().saturating_sub(n)..].to_vec()
    }

    /// Lines where the guest rejected something in the boot script.
    ///
    /// An aborted line ends in `?` and is never followed by `ok`.
    pub fn load_errors(&self) -> Vec<&str> {
        self.transcript
            .lines()
            .filter(|line| line.contains('?') && !line.contains("ok"))
            .collect()
    }
}

/// Which part of a case was running when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Commands,
}

pub struct TestRunner<C: Cpu + Default = StackMonitor> {
    blueprint: MachineBlueprint,
    snapshot: Arc<MachineSnapshot>,
    limits: TestLimits,
    realtime: RealtimeConfig,
    backend_factory: Option<BackendFactory>,
    _cpu: PhantomData<C>,
}

impl<C: Cpu + Default> TestRunner<C> {
    /// Boot a fresh machine from its storage image, feed the boot lines and
    /// snapshot the quiescent result.
    ///
    /// Anything other than running out of input (halting, exhausting the step
    /// budget) means the guest never reached its prompt, which is fatal.
    pub fn boot(blueprint: &MachineBlueprint, boot: &BootConfig) -> HarnessResult<BootReport> {
        let started = Instant::now();
        let mut machine = Machine::<C>::from_blueprint(blueprint, None)?;
        machine.reset();

        let mut input = PendingInput::from_lines(&boot.lines, None);
        let outcome = StepScheduler::for_boot(boot).run(&mut machine, &mut input)?;
        if outcome.reason != StopReason::InputExhausted {
            return Err(HarnessError::BootIncomplete(outcome.reason));
        }

        let snapshot = MachineSnapshot::capture(&machine);
        tracing::info!(
            "Boot finished in {} steps ({:.2?}), snapshot {}",
            outcome.steps,
            started.elapsed(),
            &snapshot.digest()[..12]
        );

        Ok(BootReport {
            snapshot: Arc::new(snapshot),
            transcript: decode_output(machine.output()),
            outcome,
        })
    }

    pub fn new(blueprint: MachineBlueprint, snapshot: Arc<MachineSnapshot>) -> Self {
        Self {
            blueprint,
            snapshot,
            limits: TestLimits::default(),
            realtime: RealtimeConfig::default(),
            backend_factory: None,
            _cpu: PhantomData,
        }
    }

    pub fn with_limits(mut self, limits: TestLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_backend_factory(mut self, factory: BackendFactory) -> Self {
        self.backend_factory = Some(factory);
        self
    }

    pub fn snapshot(&self) -> &Arc<MachineSnapshot> {
        &self.snapshot
    }

    /// Run one case against a freshly restored machine.
    ///
    /// Guest faults become an `error` result. Failing to build the machine at
    /// all is returned as `Err`, since no other case can succeed either.
    pub fn run_case(&self, case: &TestCase) -> HarnessResult<CaseResult> {
        let started = Instant::now();
        let backend = match (case.mode, &self.backend_factory) {
            (RunMode::Realtime, Some(factory)) => Some(factory()?),
            _ => None,
        };

        let metrics = Arc::new(PerformanceMetrics::new());
        let mut machine = self
            .snapshot
            .restore::<C>(&self.blueprint, backend)?
            .with_observer(metrics.clone());

        let run = match case.mode {
            RunMode::Batch => self
                .run_batch_case(&mut machine, case)
                .map(|outcome| (Phase::Commands, outcome)),
            RunMode::Realtime => self.run_realtime_case(&mut machine, case),
        };
        if let Some((sent, received)) = machine.frame_counts() {
            tracing::debug!("{}: {} frames sent, {} received", case.name, sent, received);
        }
        let output = decode_output(machine.output());

        let (status, outcome) = match run {
            Ok((phase, outcome)) => (judge(case, phase, &outcome, &output), Some(outcome)),
            Err(fault) => (
                CaseStatus::Error {
                    message: fault.to_string(),
                },
                None,
            ),
        };

        Ok(CaseResult {
            name: case.name.clone(),
            status,
            stop_reason: outcome.map(|o| o.reason),
            steps: outcome.map_or(0, |o| o.steps),
            output,
            duration_ms: started.elapsed().as_millis() as u64,
            metrics: metrics.summary(),
        })
    }

    fn run_batch_case(&self, machine: &mut Machine<C>, case: &TestCase) -> SimResult<ExecutionOutcome> {
        let lines: Vec<&str> = case
            .setup
            .iter()
            .chain(&case.commands)
            .map(String::as_str)
            .collect();
        let terminator = Some(self.limits.terminator.as_str()).filter(|t| !t.is_empty());
        let mut input = PendingInput::from_lines(&lines, terminator);
        StepScheduler::from_limits(&self.limits).run(machine, &mut input)
    }

    fn run_realtime_case(
        &self,
        machine: &mut Machine<C>,
        case: &TestCase,
    ) -> SimResult<(Phase, ExecutionOutcome)> {
        if !case.setup.is_empty() {
            let mut setup = PendingInput::from_lines(&case.setup, None);
            let outcome = StepScheduler::from_limits(&self.limits).run(machine, &mut setup)?;
            if outcome.reason != StopReason::InputExhausted {
                return Ok((Phase::Setup, outcome));
            }
            machine.clear_output();
        }

        let timeout = Duration::from_millis(case.timeout_ms.unwrap_or_default());
        let pump = RealtimePump::new(self.realtime.clone(), timeout).with_sentinel(case.sentinel.clone());
        let mut input = PendingInput::from_lines(&case.commands, None);
        Ok((Phase::Commands, pump.run(machine, &mut input)?))
    }

    /// Run every case whose name contains `filter`, in order.
    pub fn run_all(&self, cases: &[TestCase], filter: Option<&str>) -> HarnessResult<SuiteReport> {
        let started = Instant::now();
        let mut results = Vec::new();

        for case in cases
            .iter()
            .filter(|c| filter.map_or(true, |f| c.name.contains(f)))
        {
            let result = self.run_case(case)?;
            tracing::debug!(
                "{} finished: {} in {} steps",
                result.name,
                result.status.label(),
                result.steps
            );
            results.push(result);
        }

        Ok(SuiteReport::new(
            results,
            self.snapshot.digest(),
            started.elapsed().as_millis() as u64,
        ))
    }
}

/// Map a finished run to pass/fail.
///
/// Running out of steps or wall time fails a case that was waiting for the
/// guest to halt or print a sentinel, unless it explicitly expects that.
/// Setup that stops before consuming all of its lines fails the same way.
fn judge(case: &TestCase, phase: Phase, outcome: &ExecutionOutcome, output: &str) -> CaseStatus {
    if phase == Phase::Setup && case.expected_stop_reason().is_none() {
        let what = if outcome.reason.is_timeout() {
            "timed out"
        } else {
            "stopped early"
        };
        return CaseStatus::Fail {
            reason: format!(
                "{} during setup ({}) after {} steps",
                what, outcome.reason, outcome.steps
            ),
        };
    }

    let waits_for_signal = case.mode == RunMode::Batch || case.sentinel.is_some();
    if outcome.reason.is_timeout() && waits_for_signal && case.expected_stop_reason().is_none() {
        return CaseStatus::Fail {
            reason: format!("timed out ({}) after {} steps", outcome.reason, outcome.steps),
        };
    }

    let text = output.trim();
    for assertion in &case.assertions {
        if let Err(reason) = check_assertion(assertion, text, outcome.reason) {
            return CaseStatus::Fail { reason };
        }
    }
    CaseStatus::Pass
}

pub fn check_assertion(
    assertion: &TestAssertion,
    output: &str,
    reason: StopReason,
) -> Result<(), String> {
    match assertion {
        TestAssertion::OutputContains(a) => {
            if output.contains(&a.output_contains) {
                Ok(())
            } else {
                Err(format!(
                    "expected output to contain {:?}, got {:?}",
                    a.output_contains, output
                ))
            }
        }
        TestAssertion::OutputNotContains(a) => {
            if output.contains(&a.output_not_contains) {
                Err(format!(
                    "expected output not to contain {:?}, got {:?}",
                    a.output_not_contains, output
                ))
            } else {
                Ok(())
            }
        }
        TestAssertion::OutputRegex(a) => match regex::Regex::new(&a.output_regex) {
            Ok(re) if re.is_match(output) => Ok(()),
            Ok(_) => Err(format!(
                "expected output to match /{}/, got {:?}",
                a.output_regex, output
            )),
            Err(e) => Err(format!("invalid regex {:?}: {}", a.output_regex, e)),
        },
        TestAssertion::ExpectedStopReason(a) => {
            if a.expected_stop_reason == reason {
                Ok(())
            } else {
                Err(format!(
                    "expected stop reason {}, got {}",
                    a.expected_stop_reason, reason
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootcache_config::StopReasonAssertion;

    fn runner(boot_script: &[u8]) -> TestRunner {
        let bp = MachineBlueprint::new(0x2000, 0x100).with_storage(boot_script.to_vec());
        let boot = TestRunner::<StackMonitor>::boot(&bp, &BootConfig::default()).unwrap();
        TestRunner::new(bp, boot.snapshot)
    }

    #[test]
    fn test_status_mapping() {
        let r = runner(b"VARIABLE V\n");

        let pass = r.run_case(&TestCase::batch("add", &["2 2 + ."], "4")).unwrap();
        assert_eq!(pass.status, CaseStatus::Pass);
        assert_eq!(pass.stop_reason, Some(StopReason::Halted));

        let fail = r.run_case(&TestCase::batch("wrong", &["2 2 + ."], "5")).unwrap();
        assert!(matches!(fail.status, CaseStatus::Fail { ref reason } if reason.contains("\"5\"")));

        let error = r
            .run_case(&TestCase::batch("fault", &["1 99999999999 !"], "never"))
            .unwrap();
        assert!(matches!(error.status, CaseStatus::Error { ref message } if message.contains("violation")));
        assert_eq!(error.stop_reason, None);
    }

    #[test]
    fn test_budget_exhaustion_is_a_timeout_unless_expected() {
        let r = runner(b"\n").with_limits(TestLimits {
            max_steps: 5,
            ..TestLimits::default()
        });
        let mut case = TestCase::batch("slow", &["1 2 3 4 5 6 7 8 9 10"], "");
        let timed_out = r.run_case(&case).unwrap();
        assert!(matches!(timed_out.status, CaseStatus::Fail { ref reason } if reason.starts_with("timed out")));

        case.assertions = vec![TestAssertion::ExpectedStopReason(StopReasonAssertion {
            expected_stop_reason: StopReason::BudgetExhausted,
        })];
        assert_eq!(r.run_case(&case).unwrap().status, CaseStatus::Pass);
    }

    #[test]
    fn test_boot_must_reach_prompt() {
        let bp = MachineBlueprint::new(0x2000, 0).with_storage(b"BYE\n".to_vec());
        let err = TestRunner::<StackMonitor>::boot(&bp, &BootConfig::default()).unwrap_err();
        assert!(matches!(err, HarnessError::BootIncomplete(StopReason::Halted)));
    }

    #[test]
    fn test_boot_report_lists_load_errors() {
        let bp = MachineBlueprint::new(0x2000, 0).with_storage(b"VARIABLE V\nFROB\n1 V !\n".to_vec());
        let boot = BootConfig {
            lines: vec!["V @ .".to_string()],
            ..BootConfig::default()
        };
        let report = TestRunner::<StackMonitor>::boot(&bp, &boot).unwrap();
        assert_eq!(report.load_errors(), vec!["FROB ?"]);
        assert_eq!(report.tail(1), vec!["1  ok"]);

        let clean = runner(b"VARIABLE V\n");
        let report = TestRunner::<StackMonitor>::boot(&clean.blueprint, &BootConfig::default()).unwrap();
        assert!(report.load_errors().is_empty());
    }

    #[test]
    fn test_run_all_filters_and_counts() {
        let r = runner(b"\n");
        let cases = vec![
            TestCase::batch("math-add", &["1 1 + ."], "2"),
            TestCase::batch("math-bad", &["1 1 + ."], "3"),
            TestCase::batch("other", &["7 ."], "7"),
        ];
        let report = r.run_all(&cases, Some("math")).unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failing_names(), vec!["math-bad"]);
        assert_eq!(report.exit_code(), 1);
    }
}
