//! Process-wide step progress.
//!
//! Rank 0 of a writing code publishes its logical step as a
//! `(index, physical time)` pair. The pair is kept in a [`GlobalStep`] that
//! every coupler of the process can stamp into linked groups, and it is
//! streamed through a dedicated `<codename>-step` group so that any reader
//! can recover the writer's progress without knowing its other groups.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::GroupConfig;
use crate::core::{Error, Result, SingleProcess};
use crate::lock::{mark_done, Filesystem};
use crate::transport::{Engine, OpenMode, StepMode, Transport, TransportFactory, Value};

pub const STEP_NUMBER: &str = "StepNumber";
pub const STEP_PHYSICAL: &str = "StepPhysical";

/// One published step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepStamp {
    pub index: i64,
    pub physical: f64,
}

/// Latest published step, shared by every coupler of the process.
#[derive(Debug, Default)]
pub struct GlobalStep {
    index: AtomicI64,
    physical: AtomicU64,
    initialized: AtomicBool,
}

impl GlobalStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stamp: StepStamp) {
        self.index.store(stamp.index, Ordering::Relaxed);
        self.physical
            .store(stamp.physical.to_bits(), Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// `None` until the first [`GlobalStep::set`].
    pub fn get(&self) -> Option<StepStamp> {
        if !self.initialized.load(Ordering::Acquire) {
            return None;
        }
        Some(StepStamp {
            index: self.index.load(Ordering::Relaxed),
            physical: f64::from_bits(self.physical.load(Ordering::Relaxed)),
        })
    }
}

struct Channel {
    // Keeps the declared variables alive alongside the engine.
    _transport: Box<dyn Transport>,
    engine: Box<dyn Engine>,
}

/// Writer of the `<codename>-step` group. Only rank 0 drives it.
pub struct StepPublisher {
    name: String,
    stem: PathBuf,
    channel: Option<Channel>,
    last: Option<i64>,
}

impl StepPublisher {
    /// A publisher for group `name` writing `<dir>/<name>.bp`.
    pub fn new(name: impl Into<String>, dir: &Path) -> Self {
        let name = name.into();
        Self {
            stem: dir.join(&name),
            name,
            channel: None,
            last: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the step stream.
    pub fn path(&self) -> PathBuf {
        crate::lock::with_suffix(&self.stem, ".bp")
    }

    pub fn is_initialized(&self) -> bool {
        self.channel.is_some()
    }

    pub fn last_index(&self) -> Option<i64> {
        self.last
    }

    /// Write one step, declaring and opening the group on first use.
    pub fn publish(
        &mut self,
        factory: &dyn TransportFactory,
        config: Option<&GroupConfig>,
        stamp: StepStamp,
    ) -> Result<()> {
        if self.channel.is_none() {
            self.channel = Some(self.declare(factory, config)?);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(Error::InvalidState("step channel missing"));
        };
        let engine = &mut channel.engine;
        engine.begin_step(StepMode::Append, None)?;
        engine.put(STEP_NUMBER, Value::I64(stamp.index))?;
        engine.put(STEP_PHYSICAL, Value::F64(stamp.physical))?;
        engine.end_step()?;
        self.last = Some(stamp.index);
        log::trace!("{} published step {}", self.name, stamp.index);
        Ok(())
    }

    fn declare(
        &self,
        factory: &dyn TransportFactory,
        config: Option<&GroupConfig>,
    ) -> Result<Channel> {
        let default = GroupConfig::default();
        let config = config.unwrap_or(&default);
        let mut transport = factory.declare(&self.name, config.engine.as_deref(), &config.params)?;
        transport.define(STEP_NUMBER);
        transport.define(STEP_PHYSICAL);
        let path = self.path();
        let engine = transport
            .open(&path, OpenMode::Write, Arc::new(SingleProcess))
            .map_err(|err| Error::open(&path, err))?;
        log::info!("publishing steps to {}", path.display());
        Ok(Channel {
            _transport: transport,
            engine,
        })
    }

    /// Record the last index in `<name>.done` and close the stream.
    pub fn close(&mut self, fs: &dyn Filesystem) -> Result<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        let last = self.last.unwrap_or(-1);
        mark_done(fs, &self.stem, last)?;
        channel.engine.close()?;
        log::info!("{} closed at step {last}", self.name);
        Ok(())
    }
}
