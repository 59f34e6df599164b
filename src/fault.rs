use anyhow::{anyhow, Result};
use std::fmt;

use crate::array::ArrayController;
use crate::artifact::ArtifactSink;
use crate::logging::{self, AnnotationSink};
use crate::workload::WorkloadGenerator;

/// Fill-byte offset of the first post-grow run, so its data is told apart
/// from earlier phases in the kernel log
pub const GROW_SEED_OFFSET: usize = 0x30;

/// Health of the array as driven by the injector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayHealth {
    Clean,
    Degraded(String),
    Recovering(String),
    Growing,
}

impl fmt::Display for ArrayHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayHealth::Clean => write!(f, "clean"),
            ArrayHealth::Degraded(disk) => write!(f, "degraded({})", disk),
            ArrayHealth::Recovering(disk) => write!(f, "recovering({})", disk),
            ArrayHealth::Growing => write!(f, "growing"),
        }
    }
}

/// Drives the array through failure, recovery and growth while the workload
/// keeps writing.
pub struct FaultInjector {
    history: Vec<ArrayHealth>,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        FaultInjector {
            history: vec![ArrayHealth::Clean],
        }
    }

    pub fn health(&self) -> &ArrayHealth {
        // history always starts with Clean
        &self.history[self.history.len() - 1]
    }

    /// Every state entered so far, starting with `Clean`
    pub fn history(&self) -> &[ArrayHealth] {
        &self.history
    }

    fn enter(&mut self, next: ArrayHealth) -> Result<()> {
        let allowed = match (self.health(), &next) {
            (ArrayHealth::Clean, ArrayHealth::Degraded(_)) => true,
            (ArrayHealth::Clean, ArrayHealth::Growing) => true,
            (ArrayHealth::Degraded(a), ArrayHealth::Recovering(b)) => a == b,
            (ArrayHealth::Recovering(_), ArrayHealth::Clean) => true,
            (ArrayHealth::Growing, ArrayHealth::Clean) => true,
            _ => false,
        };
        if !allowed {
            return Err(anyhow!("array cannot go from {} to {}", self.health(), next));
        }
        log::debug!("array {} -> {}", self.health(), next);
        self.history.push(next);
        Ok(())
    }

    /// Block until the array has no resync, recovery or reshape pending.
    pub fn wait_for_clean(&mut self, ctrl: &mut dyn ArrayController) -> Result<()> {
        ctrl.wait()?;
        match self.health() {
            ArrayHealth::Clean => Ok(()),
            ArrayHealth::Degraded(disk) => Err(anyhow!("{} is still failed", disk)),
            _ => self.enter(ArrayHealth::Clean),
        }
    }

    /// Fail and re-add each member in turn, running `count / 2` random writes
    /// in each state. `quick` stops after the first member.
    pub fn degrade_test<S: AnnotationSink, A: ArtifactSink>(
        &mut self,
        ctrl: &mut dyn ArrayController,
        generator: &mut WorkloadGenerator<S, A>,
        count: usize,
        quick: bool,
    ) -> Result<()> {
        let disks = ctrl.get_disks()?;
        for disk in disks {
            self.wait_for_clean(ctrl)?;

            ctrl.degrade(&disk)?;
            self.enter(ArrayHealth::Degraded(disk.clone()))?;
            logging::status(generator.sink_mut(), format!("Degraded {}", disk))?;
            generator.run_random(count / 2, 0)?;

            ctrl.recover(&disk)?;
            self.enter(ArrayHealth::Recovering(disk.clone()))?;
            logging::status(generator.sink_mut(), format!("Recovered {}", disk))?;
            generator.run_random(count / 2, 0)?;

            self.wait_for_clean(ctrl)?;
            if quick {
                break;
            }
        }
        Ok(())
    }

    /// Grow the array by one member at a time with `count` random writes
    /// after each grow. Dual parity arrays are grown twice, others three
    /// times; `quick` stops after the first grow.
    pub fn grow_tests<S: AnnotationSink, A: ArtifactSink>(
        &mut self,
        ctrl: &mut dyn ArrayController,
        generator: &mut WorkloadGenerator<S, A>,
        count: usize,
        quick: bool,
    ) -> Result<()> {
        self.grow_once(ctrl, generator)?;
        generator.run_random(count, GROW_SEED_OFFSET)?;
        if quick {
            return Ok(());
        }

        self.grow_once(ctrl, generator)?;
        generator.run_random(count, 0)?;

        if ctrl.get_level()?.is_dual_parity() {
            log::info!("skipping third grow of a dual parity array");
            return Ok(());
        }

        self.grow_once(ctrl, generator)?;
        generator.run_random(count, 0)
    }

    fn grow_once<S: AnnotationSink, A: ArtifactSink>(
        &mut self,
        ctrl: &mut dyn ArrayController,
        generator: &mut WorkloadGenerator<S, A>,
    ) -> Result<()> {
        // a reshape must finish before the next one starts
        self.wait_for_clean(ctrl)?;
        let disks = ctrl.grow()?;
        self.enter(ArrayHealth::Growing)?;
        logging::status(generator.sink_mut(), format!("Grew array to {} disks", disks))
    }
}

#[cfg(test)]
#[path = "../tests/unit/fault_tests.rs"]
mod tests;
