use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};

/// The writer-election token for one camera: an exclusive `flock` on a
/// well-known lock file. Whoever holds it is the writer; everyone else
/// serves from the shared slot.
pub struct RoleLock {
    path: PathBuf,
}

/// Held for the full writer tenure. The kernel drops the underlying lock
/// when this guard is dropped or when the process dies for any reason,
/// which is what lets a surviving reader win the next election.
pub struct WriterGuard {
    _lock: Flock<File>,
}

impl RoleLock {
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create shared dir {}", dir.display()))?;
        Ok(Self {
            path: dir.join(format!("{name}.writer.lock")),
        })
    }

    /// Non-blocking election attempt. `None` means another live process is
    /// the writer right now.
    pub fn try_acquire(&self) -> Result<Option<WriterGuard>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("failed to open writer lock {}", self.path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(WriterGuard { _lock: lock })),
            Err((_, Errno::EAGAIN)) => Ok(None),
            Err((_, errno)) => bail!("failed to take writer lock: {errno}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::RoleLock;

    fn temp_dir() -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("restreamer-role-{suffix}"))
    }

    #[test]
    fn only_one_holder_at_a_time() {
        let dir = temp_dir();
        let lock = RoleLock::open(&dir, "cam").expect("lock should open");
        let rival = RoleLock::open(&dir, "cam").expect("lock should open");

        let guard = lock
            .try_acquire()
            .expect("acquire should not error")
            .expect("first acquire should win");

        let contested = rival.try_acquire().expect("acquire should not error");
        assert!(contested.is_none(), "second acquire must lose the election");

        drop(guard);
        let successor = rival.try_acquire().expect("acquire should not error");
        assert!(successor.is_some(), "released token must become available");
    }
}
