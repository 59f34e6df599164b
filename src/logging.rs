use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line on the kernel log channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// Issued before every test write
    Test {
        offset: u64,
        sector: u64,
        sectors: u64,
        pattern: u8,
    },
    Status(String),
}

impl Annotation {
    pub fn status(message: impl Into<String>) -> Self {
        Annotation::Status(message.into())
    }

    pub fn to_line(&self) -> String {
        match self {
            Annotation::Test {
                offset,
                sector,
                sectors,
                pattern,
            } => format!(
                "TEST {:#x} {} {} {}",
                offset,
                sector,
                sectors,
                pattern_repr(*pattern)
            ),
            Annotation::Status(message) => message.clone(),
        }
    }
}

/// Render a fill byte as a byte-string literal, e.g. `b'X'` or `b'\x00'`.
pub fn pattern_repr(byte: u8) -> String {
    match byte {
        b'\\' => r"b'\\'".to_string(),
        b'\'' => r"b'\''".to_string(),
        b'\t' => r"b'\t'".to_string(),
        b'\n' => r"b'\n'".to_string(),
        b'\r' => r"b'\r'".to_string(),
        0x20..=0x7e => format!("b'{}'", byte as char),
        _ => format!("b'\\x{:02x}'", byte),
    }
}

/// Destination for annotations
pub trait AnnotationSink {
    fn annotate(&mut self, annotation: &Annotation) -> Result<()>;
}

impl<T: AnnotationSink + ?Sized> AnnotationSink for Box<T> {
    fn annotate(&mut self, annotation: &Annotation) -> Result<()> {
        (**self).annotate(annotation)
    }
}

/// Writes annotations to the kernel ring buffer so they interleave with the
/// array driver's own messages.
pub struct KmsgSink {
    path: PathBuf,
    file: File,
}

impl KmsgSink {
    pub const DEFAULT_PATH: &'static str = "/dev/kmsg";

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open kernel log {:?}", path))?;
        Ok(KmsgSink {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl AnnotationSink for KmsgSink {
    fn annotate(&mut self, annotation: &Annotation) -> Result<()> {
        // each write(2) on /dev/kmsg is one record
        let line = format!("{}\n", annotation.to_line());
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to write to {:?}", self.path))
    }
}

/// Annotation with the time it was recorded
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub annotation: Annotation,
}

impl LogEvent {
    pub fn to_text(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.annotation.to_line()
        )
    }
}

/// In-memory sink, pruning the oldest events past `max_size`
#[derive(Debug)]
pub struct EventLog {
    events: Vec<LogEvent>,
    max_size: usize,
}

impl EventLog {
    pub fn new(max_size: usize) -> Self {
        EventLog {
            events: Vec::new(),
            max_size,
        }
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn lines(&self) -> Vec<String> {
        self.events.iter().map(|e| e.annotation.to_line()).collect()
    }

    /// Status lines only, in order
    pub fn statuses(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match &e.annotation {
                Annotation::Status(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn test_writes(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.annotation, Annotation::Test { .. }))
            .count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new(usize::MAX)
    }
}

impl AnnotationSink for EventLog {
    fn annotate(&mut self, annotation: &Annotation) -> Result<()> {
        self.events.push(LogEvent {
            timestamp: Utc::now(),
            annotation: annotation.clone(),
        });
        if self.events.len() > self.max_size {
            self.events.remove(0);
        }
        Ok(())
    }
}

/// Discards test annotations; status lines still reach `log`.
pub struct NullSink;

impl AnnotationSink for NullSink {
    fn annotate(&mut self, _annotation: &Annotation) -> Result<()> {
        Ok(())
    }
}

/// Log a status line through `log` and mirror it to the annotation sink.
pub fn status(sink: &mut dyn AnnotationSink, message: impl Into<String>) -> Result<()> {
    let annotation = Annotation::status(message);
    log::info!("{}", annotation.to_line());
    sink.annotate(&annotation)
}

#[cfg(test)]
#[path = "../tests/unit/logging_tests.rs"]
mod tests;
