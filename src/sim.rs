//! In-memory array with real redundancy, for dry runs and tests.
//!
//! Chunks are laid out RAID4-style: shard `i` of every stripe lives on member
//! `i`, parity on the trailing members. Degrading a member scrambles its
//! contents so reads have to go through reconstruction; recovering it marks
//! it for rebuild, and [`ArrayController::wait`] performs the resync.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::array::ArrayController;
use crate::config::{ArrayConfiguration, RaidLevel};
use crate::device_io::{BlockDevice, MemDevice, SECTOR_SIZE};
use crate::redundancy::StripeCodec;

const DEFAULT_MEMBER_SIZE: u64 = 12 << 20;
const SCRAMBLE: u8 = 0xEE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    InSync,
    Failed,
    /// Re-added, contents stale until the next resync
    Rebuilding,
}

#[derive(Debug)]
struct Member {
    name: String,
    data: Vec<u8>,
    state: MemberState,
}

#[derive(Debug)]
struct SimState {
    level: RaidLevel,
    chunk: usize,
    members: Vec<Member>,
    codec: StripeCodec,
    member_size: usize,
}

impl SimState {
    fn new(level: RaidLevel, chunk: usize, count: usize, member_size: usize) -> Result<Self> {
        if chunk == 0 || member_size < chunk {
            return Err(anyhow!("member size {} smaller than chunk {}", member_size, chunk));
        }
        let members = (0..count)
            .map(|i| Member {
                name: format!("sim{}", i),
                data: vec![0u8; member_size],
                state: MemberState::InSync,
            })
            .collect();
        Ok(SimState {
            level,
            chunk,
            members,
            codec: StripeCodec::for_level(level, count)?,
            member_size,
        })
    }

    fn build(config: &ArrayConfiguration, member_size: usize) -> Result<Self> {
        Self::new(
            config.level,
            config.chunk_size as usize,
            config.disk_count(),
            member_size,
        )
    }

    fn stripes(&self) -> usize {
        self.member_size / self.chunk
    }

    fn stripe_bytes(&self) -> usize {
        self.chunk * self.codec.data_shards()
    }

    fn capacity(&self) -> u64 {
        (self.stripes() * self.stripe_bytes()) as u64
    }

    fn degraded(&self) -> bool {
        self.members.iter().any(|m| m.state != MemberState::InSync)
    }

    fn load_stripe(&self, stripe: usize) -> Result<Vec<Vec<u8>>> {
        let range = stripe * self.chunk..(stripe + 1) * self.chunk;
        let mut shards: Vec<Option<Vec<u8>>> = self
            .members
            .iter()
            .map(|m| match m.state {
                MemberState::InSync => Some(m.data[range.clone()].to_vec()),
                _ => None,
            })
            .collect();
        self.codec.reconstruct(&mut shards)?;
        shards
            .into_iter()
            .map(|s| s.ok_or_else(|| anyhow!("stripe {} not reconstructed", stripe)))
            .collect()
    }

    fn store_stripe(&mut self, stripe: usize, shards: &[Vec<u8>]) {
        let range = stripe * self.chunk..(stripe + 1) * self.chunk;
        for (member, shard) in self.members.iter_mut().zip(shards) {
            if member.state != MemberState::Failed {
                member.data[range.clone()].copy_from_slice(shard);
            }
        }
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.capacity() {
            return Err(anyhow!(
                "{} bytes at {} beyond array end {}",
                len,
                offset,
                self.capacity()
            ));
        }
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let stripe_bytes = self.stripe_bytes();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset as usize + done;
            let (stripe, within) = (pos / stripe_bytes, pos % stripe_bytes);
            let n = (stripe_bytes - within).min(buf.len() - done);
            let shards = self.load_stripe(stripe)?;
            let flat: Vec<u8> = shards[..self.codec.data_shards()].concat();
            buf[done..done + n].copy_from_slice(&flat[within..within + n]);
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let stripe_bytes = self.stripe_bytes();
        let mut done = 0;
        while done < data.len() {
            let pos = offset as usize + done;
            let (stripe, within) = (pos / stripe_bytes, pos % stripe_bytes);
            let n = (stripe_bytes - within).min(data.len() - done);

            let mut shards = self.load_stripe(stripe)?;
            for (i, byte) in data[done..done + n].iter().enumerate() {
                let at = within + i;
                shards[at / self.chunk][at % self.chunk] = *byte;
            }
            self.codec.encode(&mut shards)?;
            self.store_stripe(stripe, &shards);
            done += n;
        }
        Ok(())
    }

    fn resync(&mut self) -> Result<()> {
        if !self.members.iter().any(|m| m.state == MemberState::Rebuilding) {
            return Ok(());
        }
        for stripe in 0..self.stripes() {
            let shards = self.load_stripe(stripe)?;
            self.store_stripe(stripe, &shards);
        }
        for member in &mut self.members {
            if member.state == MemberState::Rebuilding {
                log::info!("sim: {} back in sync", member.name);
                member.state = MemberState::InSync;
            }
        }
        Ok(())
    }

    fn member_mut(&mut self, name: &str) -> Result<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| anyhow!("{} is not a member", name))
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let mut image = vec![0u8; self.capacity() as usize];
        self.read(0, &mut image)?;
        Ok(image)
    }
}

fn lock(state: &Arc<Mutex<SimState>>) -> Result<MutexGuard<'_, SimState>> {
    state.lock().map_err(|_| anyhow!("simulated array lock poisoned"))
}

/// Handle on the simulated array device
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl BlockDevice for SimDevice {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        lock(&self.state)?.write(offset, data)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        lock(&self.state)?.read(offset, buf)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(lock(&self.state)?.capacity())
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE as usize
    }

    fn describe(&self) -> String {
        "sim-array".to_string()
    }
}

/// Handle on a single member, bypassing the array
struct MemberDevice {
    state: Arc<Mutex<SimState>>,
    index: usize,
}

impl BlockDevice for MemberDevice {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state)?;
        let member = &mut state.members[self.index];
        let end = offset as usize + data.len();
        if end > member.data.len() {
            return Err(anyhow!("write beyond end of {}", member.name));
        }
        member.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = lock(&self.state)?;
        let member = &state.members[self.index];
        let end = offset as usize + buf.len();
        if end > member.data.len() {
            return Err(anyhow!("read beyond end of {}", member.name));
        }
        buf.copy_from_slice(&member.data[offset as usize..end]);
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(lock(&self.state)?.member_size as u64)
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE as usize
    }

    fn describe(&self) -> String {
        format!("sim member {}", self.index)
    }
}

/// In-memory [`ArrayController`]
#[derive(Debug)]
pub struct SimArray {
    config: ArrayConfiguration,
    member_size: usize,
    state: Arc<Mutex<SimState>>,
    reference: MemDevice,
    setups: usize,
}

impl SimArray {
    pub const SPECIAL_DISK: &'static str = "sim-ref";

    pub fn new(config: ArrayConfiguration) -> Result<Self> {
        let member_size = config.size.unwrap_or(DEFAULT_MEMBER_SIZE) as usize;
        let state = SimState::build(&config, member_size)?;
        Ok(SimArray {
            config,
            member_size,
            state: Arc::new(Mutex::new(state)),
            reference: MemDevice::new(Self::SPECIAL_DISK, member_size),
            setups: 0,
        })
    }

    /// Number of times the array was (re)assembled
    pub fn setups(&self) -> usize {
        self.setups
    }

    pub fn member_states(&self) -> Result<Vec<(String, MemberState)>> {
        Ok(lock(&self.state)?
            .members
            .iter()
            .map(|m| (m.name.clone(), m.state))
            .collect())
    }

    pub fn capacity(&self) -> Result<u64> {
        Ok(lock(&self.state)?.capacity())
    }

    /// Full logical contents
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        lock(&self.state)?.snapshot()
    }

    pub fn reference(&self) -> &MemDevice {
        &self.reference
    }
}

impl ArrayController for SimArray {
    fn setup(&mut self) -> Result<()> {
        self.member_size = self.config.size.unwrap_or(DEFAULT_MEMBER_SIZE) as usize;
        let fresh = SimState::build(&self.config, self.member_size)?;
        let mut state = lock(&self.state)?;
        // members keep their contents across a re-create, like real disks
        // created with --assume-clean
        let keep = state.member_size == fresh.member_size && state.members.len() == fresh.members.len();
        let old = std::mem::replace(&mut *state, fresh);
        if keep {
            for (new, old) in state.members.iter_mut().zip(old.members) {
                new.data = old.data;
            }
        }
        self.setups += 1;
        log::info!(
            "sim: {} on {} members, chunk {}K, {} bytes",
            state.level,
            state.members.len(),
            state.chunk >> 10,
            state.capacity()
        );
        Ok(())
    }

    fn config(&self) -> &ArrayConfiguration {
        &self.config
    }

    fn config_mut(&mut self) -> &mut ArrayConfiguration {
        &mut self.config
    }

    fn open_direct(&mut self) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(SimDevice {
            state: Arc::clone(&self.state),
        }))
    }

    fn devs(&mut self) -> Result<Vec<String>> {
        self.get_disks()
    }

    fn get_disks(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state)?
            .members
            .iter()
            .map(|m| m.name.clone())
            .collect())
    }

    fn get_special_disk(&mut self) -> Result<String> {
        Ok(Self::SPECIAL_DISK.to_string())
    }

    fn open_disk(&mut self, disk: &str) -> Result<Box<dyn BlockDevice>> {
        if disk == Self::SPECIAL_DISK {
            return Ok(Box::new(self.reference.clone()));
        }
        let index = lock(&self.state)?
            .members
            .iter()
            .position(|m| m.name == disk)
            .ok_or_else(|| anyhow!("{} is not a member", disk))?;
        Ok(Box::new(MemberDevice {
            state: Arc::clone(&self.state),
            index,
        }))
    }

    fn zero_all_disks(&mut self, size: u64) -> Result<()> {
        let zeros = vec![0u8; size as usize];
        let mut disks = self.devs()?;
        disks.push(self.get_special_disk()?);
        for disk in disks {
            self.open_disk(&disk)?.write_at(0, &zeros)?;
        }
        Ok(())
    }

    fn degrade(&mut self, disk: &str) -> Result<()> {
        self.wait()?;
        let mut state = lock(&self.state)?;
        let failed = state
            .members
            .iter()
            .filter(|m| m.state != MemberState::InSync)
            .count();
        if failed + 1 > state.codec.parity_shards() {
            return Err(anyhow!(
                "failing {} would exceed the {} tolerated failures",
                disk,
                state.codec.parity_shards()
            ));
        }
        let member = state.member_mut(disk)?;
        member.state = MemberState::Failed;
        member.data.fill(SCRAMBLE);
        Ok(())
    }

    fn recover(&mut self, disk: &str) -> Result<()> {
        let mut state = lock(&self.state)?;
        let member = state.member_mut(disk)?;
        if member.state != MemberState::Failed {
            return Err(anyhow!("{} is not failed", disk));
        }
        member.state = MemberState::Rebuilding;
        Ok(())
    }

    fn grow(&mut self) -> Result<usize> {
        self.wait()?;
        let mut state = lock(&self.state)?;
        if state.degraded() {
            return Err(anyhow!("cannot grow a degraded array"));
        }
        let image = state.snapshot()?;
        let count = state.members.len() + 1;
        let mut grown = SimState::new(state.level, state.chunk, count, state.member_size)?;
        grown.write(0, &image)?;
        *state = grown;
        Ok(count)
    }

    fn get_level(&self) -> Result<RaidLevel> {
        Ok(lock(&self.state)?.level)
    }

    fn wait(&mut self) -> Result<()> {
        lock(&self.state)?.resync()
    }
}

#[cfg(test)]
#[path = "../tests/unit/sim_tests.rs"]
mod tests;
