use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Fixed name of the read-back dump left behind after a mismatch
pub const FAILURE_ARTIFACT: &str = "mdstress-readback.bin";

/// Receives the full read-back buffer of a failed write test.
pub trait ArtifactSink {
    /// Persist `data`, returning a description of where it went.
    fn persist(&mut self, data: &[u8]) -> Result<String>;
}

impl<T: ArtifactSink + ?Sized> ArtifactSink for Box<T> {
    fn persist(&mut self, data: &[u8]) -> Result<String> {
        (**self).persist(data)
    }
}

/// Writes the buffer to a fixed file, replacing any previous dump
pub struct FileArtifact {
    path: PathBuf,
}

impl FileArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileArtifact { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileArtifact {
    fn default() -> Self {
        FileArtifact::new(FAILURE_ARTIFACT)
    }
}

impl ArtifactSink for FileArtifact {
    fn persist(&mut self, data: &[u8]) -> Result<String> {
        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("bin.tmp");
        fs::write(&temp_path, data)
            .with_context(|| format!("Failed to write failure artifact {:?}", temp_path))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to commit failure artifact {:?}", self.path))?;

        let crc = crc32fast::hash(data);
        log::error!(
            "read-back buffer ({} bytes, crc32 {:08x}) saved to {}",
            data.len(),
            crc,
            self.path.display()
        );
        Ok(self.path.display().to_string())
    }
}

/// Keeps every persisted buffer in memory
#[derive(Default)]
pub struct MemoryArtifact {
    pub dumps: Vec<Vec<u8>>,
}

impl ArtifactSink for MemoryArtifact {
    fn persist(&mut self, data: &[u8]) -> Result<String> {
        self.dumps.push(data.to_vec());
        Ok(format!("memory dump #{}", self.dumps.len()))
    }
}
