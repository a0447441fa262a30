#[cfg(test)]
mod tests {
    use crate::cpu::StackMonitor;
    use crate::decoder::decode_output;
    use crate::metrics::PerformanceMetrics;
    use crate::realtime::{RealtimeConfig, RealtimePump};
    use crate::report::CaseStatus;
    use crate::runner::TestRunner;
    use crate::scheduler::{PendingInput, StepScheduler};
    use crate::snapshot::MachineSnapshot;
    use crate::{Guest, Machine, MachineBlueprint, StopReason};
    use bootcache_config::{BootConfig, TestCase};
    use std::sync::Arc;
    use std::time::Duration;

    const BOOT_SCRIPT: &[u8] = b"VARIABLE COUNTER\n41 COUNTER !\n";

    fn blueprint() -> MachineBlueprint {
        MachineBlueprint::new(0x4000, 0x1000).with_storage(BOOT_SCRIPT.to_vec())
    }

    fn boot() -> Arc<MachineSnapshot> {
        let boot = BootConfig {
            lines: vec!["1 COUNTER +!".to_string()],
            ..BootConfig::default()
        };
        TestRunner::<StackMonitor>::boot(&blueprint(), &boot)
            .unwrap()
            .snapshot
    }

    fn run_lines(snapshot: &MachineSnapshot, lines: &[&str]) -> (Vec<u8>, StopReason) {
        let mut machine = snapshot.restore::<StackMonitor>(&blueprint(), None).unwrap();
        let mut input = PendingInput::from_lines(lines, Some("BYE"));
        let outcome = StepScheduler::new(1000, 1_000_000)
            .run(&mut machine, &mut input)
            .unwrap();
        (machine.output().to_vec(), outcome.reason)
    }

    #[test]
    fn test_scenario_simple_arithmetic() {
        let snapshot = boot();
        let (out, reason) = run_lines(&snapshot, &["2 2 + ."]);
        assert_eq!(reason, StopReason::Halted);
        assert!(decode_output(&out).contains('4'));
    }

    #[test]
    fn test_restores_are_deterministic() {
        let snapshot = boot();
        let lines = ["COUNTER @ .", "3 4 * . CR", ".\" done\""];
        let (a, _) = run_lines(&snapshot, &lines);
        let (b, _) = run_lines(&snapshot, &lines);
        assert_eq!(a, b);
        assert_eq!(decode_output(&a), "42  ok\n12 \n ok\ndone ok\n");
    }

    #[test]
    fn test_runs_do_not_leak_into_each_other() {
        let snapshot = boot();
        let (first, _) = run_lines(&snapshot, &["100 COUNTER !", "COUNTER @ ."]);
        assert!(decode_output(&first).contains("100"));

        // Second restore sees the snapshot-time value, not the mutation above.
        let (second, _) = run_lines(&snapshot, &["COUNTER @ ."]);
        assert_eq!(decode_output(&second), "42  ok\n");
    }

    #[test]
    fn test_capture_of_restore_is_idempotent() {
        let snapshot = boot();
        let restored = snapshot.restore::<StackMonitor>(&blueprint(), None).unwrap();
        assert_eq!(MachineSnapshot::capture(&restored).digest(), snapshot.digest());
    }

    #[test]
    fn test_one_chunk_per_line() {
        let snapshot = boot();
        let metrics = Arc::new(PerformanceMetrics::new());
        let mut machine = snapshot
            .restore::<StackMonitor>(&blueprint(), None)
            .unwrap()
            .with_observer(metrics.clone());

        let mut input = PendingInput::from_payload(b"1 .\n2 .\n3 .");
        let outcome = StepScheduler::new(7, 1_000_000)
            .run(&mut machine, &mut input)
            .unwrap();

        assert_eq!(outcome.reason, StopReason::InputExhausted);
        assert_eq!(input.chunks_fed(), 3);
        assert_eq!(metrics.summary().input_chunks, 3);
        // The trailing partial line is fed but never terminated.
        assert_eq!(decode_output(machine.output()), "1  ok\n2  ok\n");
    }

    #[test]
    fn test_forced_idle_ticks_leave_idle_guest_silent() {
        let snapshot = boot();
        let mut machine = snapshot.restore::<StackMonitor>(&blueprint(), None).unwrap();
        let config = RealtimeConfig {
            idle_sleep: Duration::from_millis(1),
            ..RealtimeConfig::default()
        };
        let outcome = RealtimePump::new(config, Duration::from_millis(40))
            .run(&mut machine, &mut PendingInput::default())
            .unwrap();

        assert_eq!(outcome.reason, StopReason::WallClockTimeout);
        assert!(machine.output().is_empty());
        assert!(!machine.is_halted());
        // The guest state only differs by the cycles burnt re-checking its input.
        let after = MachineSnapshot::capture(&machine);
        assert_eq!(after.ram(), snapshot.ram());
    }

    #[test]
    fn test_runner_reports_scenarios() {
        let runner = TestRunner::<StackMonitor>::new(blueprint(), boot());
        let cases = vec![
            TestCase::batch("counter", &["COUNTER @ ."], "42"),
            TestCase::batch("mutate", &["1 COUNTER +!", "COUNTER @ ."], "43"),
            TestCase::batch("again", &["COUNTER @ ."], "42"),
            TestCase::batch("unknown word", &["FROB"], "FROB ?"),
        ];
        let report = runner.run_all(&cases, None).unwrap();
        for r in &report.results {
            assert_eq!(r.status, CaseStatus::Pass, "{}: {:?}", r.name, r.status);
        }
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.snapshot_digest, runner.snapshot().digest());
    }

    #[test]
    fn test_non_quiescent_capture_still_works() {
        let mut machine =
            Machine::<StackMonitor>::from_blueprint(&MachineBlueprint::new(0x1000, 0), None)
                .unwrap();
        machine.reset();
        machine.inject_input(b"1 2 +\n");
        assert!(!machine.is_quiescent());

        let snap = MachineSnapshot::capture(&machine);
        // Unread console input is not part of the checkpoint.
        let restored = snap
            .restore::<StackMonitor>(&MachineBlueprint::new(0x1000, 0), None)
            .unwrap();
        assert!(!restored.has_pending_input());
    }
}
