use anyhow::Result;

use crate::array::ArrayController;
use crate::artifact::ArtifactSink;
use crate::config::IntegrityConfig;
use crate::error::HarnessError;
use crate::fault::FaultInjector;
use crate::logging::{self, AnnotationSink};
use crate::verify::VerificationEngine;
use crate::workload::WorkloadGenerator;

/// Arrays built from kernel devices can only be driven as root.
pub fn ensure_privileges(ctrl: &dyn ArrayController) -> Result<()> {
    if ctrl.requires_root() && !nix::unistd::Uid::effective().is_root() {
        return Err(HarnessError::Precondition("must be run as root".to_string()).into());
    }
    Ok(())
}

/// Totals of a finished integrity run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub writes: u64,
    pub bytes: u64,
    pub verified_bytes: Option<u64>,
}

/// One integrity run against one array
pub struct IntegritySession<'a, S: AnnotationSink, A: ArtifactSink> {
    ctrl: &'a mut dyn ArrayController,
    config: IntegrityConfig,
    sink: S,
    artifact: A,
}

impl<'a, S: AnnotationSink, A: ArtifactSink> IntegritySession<'a, S, A> {
    pub fn new(ctrl: &'a mut dyn ArrayController, config: IntegrityConfig, sink: S, artifact: A) -> Self {
        IntegritySession {
            ctrl,
            config,
            sink,
            artifact,
        }
    }

    /// Run every enabled phase; the first failure ends the run.
    pub fn run(self) -> Result<(SessionSummary, S, A)> {
        ensure_privileges(&*self.ctrl)?;
        let IntegritySession {
            ctrl,
            config,
            sink,
            artifact,
        } = self;

        let mut verifier = VerificationEngine::new();
        if config.verify {
            verifier.prepare(ctrl)?;
        }
        ctrl.setup()?;

        let device = ctrl.open_direct()?;
        let mut generator = WorkloadGenerator::new(device, sink, artifact, config.seed);
        if config.verify {
            verifier.attach(ctrl, &mut generator)?;
        }

        if config.basic {
            logging::status(generator.sink_mut(), "Running basic tests")?;
            generator.basic_tests()?;
        }
        if config.random {
            logging::status(
                generator.sink_mut(),
                format!("Running {} random tests", config.count),
            )?;
            generator.run_random(config.count, 0)?;
        }

        let mut injector = FaultInjector::new();
        if config.degrade {
            logging::status(generator.sink_mut(), "Running degrade tests")?;
            injector.degrade_test(ctrl, &mut generator, config.count, config.quick)?;
        }
        if config.grow {
            logging::status(generator.sink_mut(), "Running grow tests")?;
            injector.grow_tests(ctrl, &mut generator, config.count, config.quick)?;
        }

        injector.wait_for_clean(ctrl)?;

        let mut summary = SessionSummary::default();
        if let Some(mut reference) = generator.detach_reference() {
            logging::status(generator.sink_mut(), "Verifying against reference disk")?;
            verifier.verify(generator.device_mut(), reference.as_mut())?;
            summary.verified_bytes = verifier.window().map(|w| w.size_bytes);
        }

        let (writes, bytes) = generator.totals();
        summary.writes = writes;
        summary.bytes = bytes;
        logging::status(
            generator.sink_mut(),
            format!("Integrity tests passed: {} writes, {} bytes", writes, bytes),
        )?;

        let (sink, artifact) = generator.into_parts();
        Ok((summary, sink, artifact))
    }
}

#[cfg(test)]
#[path = "../tests/unit/session_tests.rs"]
mod tests;
