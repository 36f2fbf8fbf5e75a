//! Sentinel-file critical sections.
//!
//! A writer and a fixed set of readers share one file-backed data file. The
//! writer may not flush while a reader is mid-read, and a reader may not
//! read while the writer is mid-write. Only rank 0 of each side touches the
//! sentinels; the remaining ranks learn the outcome through the group
//! barrier that closes every acquire and opens every release.
//!
//! ```text
//! writer acquire: create busy-writer, wait until every busy-reader-* is gone
//! reader acquire: wait until busy-writer is gone, create busy-reader-<me>,
//!                 re-check busy-writer; if it came back, remove ours, restart
//! release:        barrier, rank 0 removes its own sentinel
//! ```
//!
//! This is advisory locking: nothing here is atomic, races are settled by the
//! reader's verify-and-restart loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CodeTopology, WRITER_SUFFIX};
use crate::core::wait::poll_until;
use crate::core::{Deadline, Error, ProcessGroup, Result, WaitStrategy};
use crate::lock::owner::OwnerRecord;
use crate::lock::sentinel::{done_path, with_suffix, Filesystem};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Writer,
    Reader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOptions {
    pub strategy: WaitStrategy,
    /// Bound on each lock wait; `None` waits forever.
    pub timeout: Option<Duration>,
    pub verify_checks: u32,
    pub max_reader_restarts: u32,
    pub reclaim_stale: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        crate::config::LockConfig::default().options()
    }
}

/// Every marker derived from one data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentinelPaths {
    writer: PathBuf,
    own_reader: PathBuf,
    readers: Vec<PathBuf>,
    done: PathBuf,
}

impl SentinelPaths {
    pub fn derive(filename: &Path, topology: &CodeTopology) -> Self {
        Self {
            writer: with_suffix(filename, WRITER_SUFFIX),
            own_reader: with_suffix(filename, &topology.own_reader_suffix()),
            readers: topology
                .reader_suffixes()
                .iter()
                .map(|suffix| with_suffix(filename, suffix))
                .collect(),
            done: done_path(filename),
        }
    }

    pub fn writer(&self) -> &Path {
        &self.writer
    }

    pub fn own_reader(&self) -> &Path {
        &self.own_reader
    }

    pub fn readers(&self) -> &[PathBuf] {
        &self.readers
    }

    pub fn done(&self) -> &Path {
        &self.done
    }

    fn own(&self, role: Role) -> &Path {
        match role {
            Role::Writer => &self.writer,
            Role::Reader => &self.own_reader,
        }
    }
}

pub struct CriticalSection<'a> {
    fs: &'a dyn Filesystem,
    group: &'a dyn ProcessGroup,
    paths: &'a SentinelPaths,
    options: &'a LockOptions,
}

impl<'a> CriticalSection<'a> {
    pub fn new(
        fs: &'a dyn Filesystem,
        group: &'a dyn ProcessGroup,
        paths: &'a SentinelPaths,
        options: &'a LockOptions,
    ) -> Self {
        Self {
            fs,
            group,
            paths,
            options,
        }
    }

    /// Enter the critical section for `role` on every rank.
    pub fn acquire(&self, role: Role) -> Result<()> {
        let outcome = if self.group.is_root() {
            match role {
                Role::Writer => self.until_readers_vacate(),
                Role::Reader => self.until_writer_vacates(),
            }
        } else {
            Ok(())
        };
        let agreed = self.group.agree(outcome.is_ok());
        outcome?;
        if !agreed {
            return Err(Error::LockStall {
                path: self.paths.own(role).to_path_buf(),
                waited: Duration::ZERO,
            });
        }
        log::debug!("acquired {:?} lock on {}", role, self.paths.own(role).display());
        Ok(())
    }

    /// Leave the critical section for `role` on every rank.
    pub fn release(&self, role: Role) -> Result<()> {
        self.group.barrier();
        if self.group.is_root() {
            let path = self.paths.own(role);
            if !self.fs.remove(path)? {
                log::warn!("sentinel {} vanished before release", path.display());
            }
            log::debug!("released {:?} lock on {}", role, path.display());
        }
        Ok(())
    }

    fn until_readers_vacate(&self) -> Result<()> {
        let deadline = Deadline::after(self.options.timeout);
        self.create_sentinel(&self.paths.writer)?;
        for reader in &self.paths.readers {
            if !self.wait_absent(reader, deadline)? {
                // Readers must not stay blocked behind a writer that gave up.
                self.fs.remove(&self.paths.writer)?;
                return Err(stall(reader, deadline));
            }
        }
        Ok(())
    }

    fn until_writer_vacates(&self) -> Result<()> {
        let deadline = Deadline::after(self.options.timeout);
        let mut restarts: u32 = 0;
        loop {
            if !self.wait_absent(&self.paths.writer, deadline)? {
                return Err(stall(&self.paths.writer, deadline));
            }
            self.create_sentinel(&self.paths.own_reader)?;
            if !self.writer_reappeared() {
                return Ok(());
            }
            self.fs.remove(&self.paths.own_reader)?;
            restarts += 1;
            log::warn!(
                "writer re-entered {} during reader acquire (restart {restarts})",
                self.paths.writer.display()
            );
            if restarts > self.options.max_reader_restarts {
                return Err(stall(&self.paths.writer, deadline));
            }
        }
    }

    fn writer_reappeared(&self) -> bool {
        (0..self.options.verify_checks).any(|check| {
            if check > 0 {
                std::thread::yield_now();
            }
            self.fs.exists(&self.paths.writer)
        })
    }

    fn wait_absent(&self, path: &Path, deadline: Deadline) -> Result<bool> {
        poll_until(&self.options.strategy, deadline, || {
            if !self.fs.exists(path) {
                return Ok(true);
            }
            Ok(self.options.reclaim_stale && self.reclaim_if_orphaned(path)?)
        })
    }

    fn create_sentinel(&self, path: &Path) -> Result<()> {
        if self.options.reclaim_stale {
            let record = OwnerRecord::current()?;
            self.fs.write(path, record.encode().as_bytes())?;
        } else {
            self.fs.create_empty(path)?;
        }
        Ok(())
    }

    fn reclaim_if_orphaned(&self, path: &Path) -> Result<bool> {
        let Ok(contents) = self.fs.read_to_string(path) else {
            return Ok(false);
        };
        match OwnerRecord::parse(&contents) {
            Some(owner) if !owner.is_alive() => {
                log::warn!(
                    "reclaiming {} left by exited process {}",
                    path.display(),
                    owner.pid
                );
                self.fs.remove(path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn stall(path: &Path, deadline: Deadline) -> Error {
    Error::LockStall {
        path: path.to_path_buf(),
        waited: deadline.elapsed(),
    }
}
