use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use memmap2::MmapMut;
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use tokio::time::{Instant, sleep};

use crate::core::frame::{Frame, now_micros};

const HEADER_BYTES: usize = 16;
const LOCK_RETRY_PAUSE: Duration = Duration::from_millis(25);
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of polling the slot for a frame.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A frame the caller has not served yet.
    Fresh(Frame),
    /// Slot still holds the frame this caller saw last; keep polling.
    Unchanged,
    /// No usable frame: slot empty, frame too old, or lock wait timed out.
    Stale,
}

/// Latest-frame slot shared by every process serving the same camera.
///
/// The slot is a memory-mapped file holding one timestamp, one length, and
/// one JPEG body. All access happens under an exclusive `flock` on a
/// sibling lock file, so a reader observes either the previous complete
/// frame or the new complete one, never a mix. Processes rendezvous on the
/// file paths, nothing else.
pub struct SharedSlot {
    mmap: MmapMut,
    lock_path: PathBuf,
    capacity: usize,
}

impl SharedSlot {
    pub fn open(dir: &Path, name: &str, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create shared dir {}", dir.display()))?;

        let slot_path = dir.join(format!("{name}.slot"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&slot_path)
            .with_context(|| format!("failed to open shared slot {}", slot_path.display()))?;

        let needed = (HEADER_BYTES + capacity) as u64;
        if file
            .metadata()
            .context("failed to stat shared slot file")?
            .len()
            < needed
        {
            file.set_len(needed)
                .context("failed to size shared slot file")?;
        }

        let mmap =
            unsafe { MmapMut::map_mut(&file) }.context("failed to map shared slot file")?;

        Ok(Self {
            mmap,
            lock_path: dir.join(format!("{name}.slot.lock")),
            capacity,
        })
    }

    /// Store a frame, replacing whatever the slot held. Blocks (bounded)
    /// on the slot lock; never held across any network call.
    pub async fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.len() > self.capacity {
            bail!(
                "frame of {} bytes exceeds slot capacity of {} bytes",
                frame.len(),
                self.capacity
            );
        }
        let Some(_guard) = self.lock(WRITE_LOCK_TIMEOUT).await? else {
            bail!("timed out waiting for the shared slot lock");
        };

        self.mmap[0..8].copy_from_slice(&frame.timestamp_us.to_le_bytes());
        self.mmap[8..16].copy_from_slice(&(frame.len() as u64).to_le_bytes());
        self.mmap[HEADER_BYTES..HEADER_BYTES + frame.len()].copy_from_slice(&frame.data);
        Ok(())
    }

    /// Poll the slot. `last_seen` is the timestamp of the frame this caller
    /// served most recently; an identical stored timestamp yields
    /// `Unchanged` rather than a duplicate frame. Lock waits are bounded by
    /// `lock_timeout` so the caller stays responsive; a timeout reads as
    /// `Stale`, as does any frame older than `max_age`.
    pub async fn read(
        &self,
        last_seen: Option<u64>,
        max_age: Duration,
        lock_timeout: Duration,
    ) -> Result<ReadOutcome> {
        let Some(_guard) = self.lock(lock_timeout).await? else {
            return Ok(ReadOutcome::Stale);
        };

        let timestamp_us = u64::from_le_bytes(read_word(&self.mmap[0..8]));
        let len = u64::from_le_bytes(read_word(&self.mmap[8..16])) as usize;
        if timestamp_us == 0 || len == 0 || len > self.capacity {
            return Ok(ReadOutcome::Stale);
        }

        let age = Duration::from_micros(now_micros().saturating_sub(timestamp_us));
        if age > max_age {
            return Ok(ReadOutcome::Stale);
        }
        if last_seen == Some(timestamp_us) {
            return Ok(ReadOutcome::Unchanged);
        }

        let data = Bytes::copy_from_slice(&self.mmap[HEADER_BYTES..HEADER_BYTES + len]);
        Ok(ReadOutcome::Fresh(Frame { data, timestamp_us }))
    }

    async fn lock(&self, timeout: Duration) -> Result<Option<Flock<File>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lock_path)
                .with_context(|| {
                    format!("failed to open slot lock {}", self.lock_path.display())
                })?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(guard) => return Ok(Some(guard)),
                Err((_, Errno::EAGAIN)) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    sleep(LOCK_RETRY_PAUSE).await;
                }
                Err((_, errno)) => bail!("failed to lock shared slot: {errno}"),
            }
        }
    }
}

fn read_word(bytes: &[u8]) -> [u8; 8] {
    let mut word = [0_u8; 8];
    word.copy_from_slice(bytes);
    word
}
