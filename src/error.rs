use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Fatal conditions the harness reports to the operator.
///
/// Everything else travels as a plain `anyhow::Error` with context; these
/// variants are wrapped into `anyhow` and recovered with `downcast_ref` by the
/// binary to pick an exit code.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Read-back or final verification mismatch
    #[error("data mismatch at offset {offset:#x} ({offset}): {detail}")]
    DataIntegrity { offset: u64, detail: String },

    /// A subprocess collaborator exited unsuccessfully
    #[error("command failed ({status}): {command}{}", format_stderr(.stderr))]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },

    /// Missing privilege or required input, raised before anything destructive
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("interrupted")]
    Interrupted,
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{}", trimmed)
    }
}

impl HarnessError {
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Interrupted => 130,
            _ => 1,
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the Ctrl-C handler. Blocking loops poll [`check_interrupt`].
pub fn install_interrupt_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(request_interrupt)?;
    Ok(())
}

/// Raise the interrupt flag the way Ctrl-C does.
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Lower the flag so another run can start in the same process.
pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Unwind with [`HarnessError::Interrupted`] once an interrupt was requested.
pub fn check_interrupt() -> anyhow::Result<()> {
    if interrupted() {
        return Err(HarnessError::Interrupted.into());
    }
    Ok(())
}

#[cfg(test)]
#[path = "../tests/unit/error_tests.rs"]
mod tests;
