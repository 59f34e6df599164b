//! Ctrl-C handling. The interrupt flag is process-wide, so everything that
//! raises it lives in this one test binary and runs in sequence.

use anyhow::Result;
use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;

use mdstress::array::run_checked;
use mdstress::artifact::MemoryArtifact;
use mdstress::bench::{BenchRequest, BenchResult, BenchmarkRunner, FioOutput};
use mdstress::config::{ArrayConfiguration, DiskSource, HarnessConfig, RaidLevel};
use mdstress::device_io::MemDevice;
use mdstress::error::{clear_interrupt, interrupted, request_interrupt};
use mdstress::logging::{Annotation, AnnotationSink, EventLog};
use mdstress::sweep::{Direction, PerfSweepEngine};
use mdstress::verify::VerificationEngine;
use mdstress::workload::WorkloadGenerator;
use mdstress::{ArrayController, HarnessError, IntegritySession, SimArray};

fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<HarnessError>(), Some(HarnessError::Interrupted))
}

/// Raises the flag once `after` TEST lines have gone through
struct CtrlCAfter {
    log: Rc<RefCell<EventLog>>,
    after: usize,
}

impl AnnotationSink for CtrlCAfter {
    fn annotate(&mut self, annotation: &Annotation) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.annotate(annotation)?;
        if log.test_writes() == self.after {
            request_interrupt();
        }
        Ok(())
    }
}

fn random_run_stops_before_next_write() -> Result<()> {
    let log = Rc::new(RefCell::new(EventLog::default()));
    let sink = CtrlCAfter {
        log: Rc::clone(&log),
        after: 3,
    };
    let device = MemDevice::new("mem0", 16 << 20);
    let mut generator = WorkloadGenerator::new(Box::new(device), sink, MemoryArtifact::default(), 5);

    let err = generator.run_random(10, 0).unwrap_err();
    assert!(is_interrupted(&err));
    // the third write was already under way and completes; nothing after it
    assert_eq!(log.borrow().test_writes(), 3);
    assert_eq!(generator.totals().0, 3);
    assert!(generator.artifact().dumps.is_empty());
    clear_interrupt();
    Ok(())
}

fn session_never_writes_once_interrupted() -> Result<()> {
    let config = HarnessConfig::simulated();
    let mut array = SimArray::new(config.array.clone())?;
    let log = Rc::new(RefCell::new(EventLog::default()));
    let sink = CtrlCAfter {
        log: Rc::clone(&log),
        after: usize::MAX,
    };

    request_interrupt();
    let err = IntegritySession::new(&mut array, config.integrity.clone(), sink, MemoryArtifact::default())
        .run()
        .err()
        .unwrap();
    assert!(is_interrupted(&err));
    assert_eq!(log.borrow().test_writes(), 0);
    assert_eq!(log.borrow().statuses(), vec!["Running basic tests"]);
    clear_interrupt();
    Ok(())
}

fn verify_unwinds() -> Result<()> {
    let config = HarnessConfig::simulated();
    let mut array = SimArray::new(config.array.clone())?;
    let mut verifier = VerificationEngine::new();
    verifier.prepare(&mut array)?;
    array.setup()?;
    let mut device = array.open_direct()?;
    let mut reference = array.open_disk(SimArray::SPECIAL_DISK)?;

    verifier.verify(device.as_mut(), reference.as_mut())?;
    request_interrupt();
    let err = verifier.verify(device.as_mut(), reference.as_mut()).unwrap_err();
    assert!(is_interrupted(&err));
    clear_interrupt();
    Ok(())
}

/// Raises the flag from inside the first benchmark run
#[derive(Default)]
struct CtrlCRunner {
    runs: usize,
}

impl BenchmarkRunner for CtrlCRunner {
    fn run(&mut self, _request: &BenchRequest) -> Result<BenchResult> {
        self.runs += 1;
        request_interrupt();
        Ok(BenchResult {
            cmd: vec!["fio".to_string()],
            result: FioOutput::default(),
            cpu: None,
        })
    }
}

fn sweep_stops_between_measurements() -> Result<()> {
    let mut array = SimArray::new(ArrayConfiguration {
        level: RaidLevel::Raid5,
        chunk_size: 4096,
        disks: DiskSource::RamDisks { count: 3 },
        ..ArrayConfiguration::default()
    })?;
    let mut sweep = HarnessConfig::full().sweep;
    sweep.directions = vec![Direction::Read, Direction::Write];

    let mut engine = PerfSweepEngine::new(sweep, 1 << 20, CtrlCRunner::default());
    let err = engine.run(&mut array).unwrap_err();
    assert!(is_interrupted(&err));
    assert_eq!(engine.runner().runs, 1);
    assert_eq!(array.setups(), 1);
    clear_interrupt();
    Ok(())
}

fn external_tool_unwinds() -> Result<()> {
    assert_eq!(run_checked(&mut Command::new("true"))?, "");
    request_interrupt();
    let err = run_checked(&mut Command::new("true")).unwrap_err();
    assert!(is_interrupted(&err));
    assert_eq!(HarnessError::Interrupted.exit_code(), 130);
    clear_interrupt();
    Ok(())
}

#[test]
fn test_interrupt_unwinds_every_loop() -> Result<()> {
    assert!(!interrupted());
    random_run_stops_before_next_write()?;
    session_never_writes_once_interrupted()?;
    verify_unwinds()?;
    sweep_stops_between_measurements()?;
    external_tool_unwinds()?;
    assert!(!interrupted());
    Ok(())
}
