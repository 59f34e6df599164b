use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::artifact::ArtifactSink;
use crate::device_io::{BlockDevice, SECTOR_SIZE};
use crate::error::{check_interrupt, HarnessError};
use crate::logging::{Annotation, AnnotationSink};

/// Random writes start below this sector
pub const RANDOM_SECTOR_LIMIT: u64 = 10_000;
/// Random writes are shorter than this
pub const RANDOM_SIZE_LIMIT: usize = 1 << 20;

/// One test write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    pub offset_sectors: u64,
    pub size_bytes: usize,
    pub fill_byte: u8,
}

impl WorkloadDescriptor {
    pub fn new(offset_sectors: u64, fill_byte: u8, size_bytes: usize) -> Self {
        WorkloadDescriptor {
            offset_sectors,
            size_bytes,
            fill_byte,
        }
    }

    pub fn offset_bytes(&self) -> u64 {
        self.offset_sectors * SECTOR_SIZE
    }

    pub fn sectors(&self) -> u64 {
        self.size_bytes as u64 / SECTOR_SIZE
    }
}

/// Overlapping, adjacent and chunk-straddling writes, in order
const BASIC_SEQUENCE: &[(u64, u8, usize)] = &[
    (0, b'X', 512),
    (1544, b'Y', 512),
    (1, b'A', 4096),
    (8, b'B', 512),
    (7, b'C', 1024),
    (120, b'D', 64 << 10),
    (127, b'E', 1024),
    (255, b'F', 512),
    (256, b'G', 128 << 10),
    (1543, b'H', 1536),
    (0, b'Z', 1 << 20),
];

pub fn basic_sequence() -> impl Iterator<Item = WorkloadDescriptor> {
    BASIC_SEQUENCE
        .iter()
        .map(|&(sector, fill, size)| WorkloadDescriptor::new(sector, fill, size))
}

/// Seeded source of random write descriptors
pub struct RandomWorkload {
    rng: StdRng,
}

impl RandomWorkload {
    pub fn new(seed: u64) -> Self {
        RandomWorkload {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Descriptor for iteration `iteration` of a run offset by `seed_offset`
    pub fn next(&mut self, seed_offset: usize, iteration: usize) -> WorkloadDescriptor {
        let sector = self.rng.gen_range(0..RANDOM_SECTOR_LIMIT);
        let sectors = self
            .rng
            .gen_range(1..(RANDOM_SIZE_LIMIT as u64 / SECTOR_SIZE));
        let fill = ((seed_offset + iteration) % 256) as u8;
        WorkloadDescriptor::new(sector, fill, (sectors * SECTOR_SIZE) as usize)
    }
}

/// Issues test writes against the array device, checks each one by reading
/// it back, and mirrors it to the reference disk when one is attached.
pub struct WorkloadGenerator<S: AnnotationSink, A: ArtifactSink> {
    device: Box<dyn BlockDevice>,
    reference: Option<Box<dyn BlockDevice>>,
    sink: S,
    artifact: A,
    random: RandomWorkload,
    writes: u64,
    bytes: u64,
}

impl<S: AnnotationSink, A: ArtifactSink> WorkloadGenerator<S, A> {
    pub fn new(device: Box<dyn BlockDevice>, sink: S, artifact: A, seed: u64) -> Self {
        WorkloadGenerator {
            device,
            reference: None,
            sink,
            artifact,
            random: RandomWorkload::new(seed),
            writes: 0,
            bytes: 0,
        }
    }

    pub fn attach_reference(&mut self, reference: Box<dyn BlockDevice>) {
        log::info!("mirroring writes to {}", reference.describe());
        self.reference = Some(reference);
    }

    pub fn detach_reference(&mut self) -> Option<Box<dyn BlockDevice>> {
        self.reference.take()
    }

    pub fn device_mut(&mut self) -> &mut dyn BlockDevice {
        self.device.as_mut()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn artifact(&self) -> &A {
        &self.artifact
    }

    /// Give back the sink and artifact, closing the devices
    pub fn into_parts(self) -> (S, A) {
        (self.sink, self.artifact)
    }

    /// (writes, bytes) issued so far
    pub fn totals(&self) -> (u64, u64) {
        (self.writes, self.bytes)
    }

    /// Write `size_bytes` of `fill_byte` at `offset_sectors`, then read it
    /// back and compare.
    pub fn write_test(&mut self, offset_sectors: u64, fill_byte: u8, size_bytes: usize) -> Result<()> {
        self.execute(&WorkloadDescriptor::new(offset_sectors, fill_byte, size_bytes))
    }

    pub fn execute(&mut self, desc: &WorkloadDescriptor) -> Result<()> {
        check_interrupt()?;

        let offset = desc.offset_bytes();
        let data = vec![desc.fill_byte; desc.size_bytes];

        self.sink.annotate(&Annotation::Test {
            offset,
            sector: desc.offset_sectors,
            sectors: desc.sectors(),
            pattern: desc.fill_byte,
        })?;

        self.device.write_at(offset, &data)?;
        if let Some(reference) = self.reference.as_mut() {
            reference.write_at(offset, &data)?;
        }

        let mut readback = vec![0u8; desc.size_bytes];
        self.device.read_at(offset, &mut readback)?;
        self.writes += 1;
        self.bytes += desc.size_bytes as u64;

        if readback == data {
            return Ok(());
        }

        let index = data
            .iter()
            .zip(&readback)
            .position(|(w, r)| w != r)
            .unwrap_or(0);
        let saved = self.artifact.persist(&readback)?;
        let detail = format!(
            "wrote {} bytes of {:#04x} at sector {}, read back {:#04x}; read-back saved to {}",
            desc.size_bytes, desc.fill_byte, desc.offset_sectors, readback[index], saved
        );
        log::error!("mismatch at offset {:#x}: {}", offset + index as u64, detail);
        Err(HarnessError::DataIntegrity {
            offset: offset + index as u64,
            detail,
        }
        .into())
    }

    /// Fixed smoke sequence, independent of the random seed
    pub fn basic_tests(&mut self) -> Result<()> {
        for desc in basic_sequence() {
            self.execute(&desc)?;
        }
        Ok(())
    }

    /// `count` random writes; the fill byte of write `i` is `seed_offset + i`
    /// modulo 256. Stops at the first failure.
    pub fn run_random(&mut self, count: usize, seed_offset: usize) -> Result<()> {
        for i in 0..count {
            let desc = self.random.next(seed_offset, i);
            self.execute(&desc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/unit/workload_tests.rs"]
mod tests;
