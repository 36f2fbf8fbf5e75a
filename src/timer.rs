//! Named wall-clock timers.
//!
//! Each timer writes one step per `stop` to `<timing dir>/<name>.bp`, holding
//! the seconds elapsed since the matching `start` in a `time` field.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::{Clock, Error, ProcessGroup, Result};
use crate::transport::{Engine, OpenMode, StepMode, Transport, TransportFactory, Value};

pub const TIME_FIELD: &str = "time";

struct Timer {
    _transport: Box<dyn Transport>,
    engine: Box<dyn Engine>,
    start: Option<u64>,
}

pub struct Timers {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    timers: BTreeMap<String, Timer>,
}

impl Timers {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
            timers: BTreeMap::new(),
        }
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    /// Start (or restart) timer `name`, creating its output on first use.
    pub fn start(
        &mut self,
        name: &str,
        factory: &dyn TransportFactory,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<()> {
        if !self.timers.contains_key(name) {
            let mut transport = factory.declare(name, None, &BTreeMap::new())?;
            transport.define(TIME_FIELD);
            let path = self.dir.join(format!("{name}.bp"));
            let engine = transport
                .open(&path, OpenMode::Write, group)
                .map_err(|err| Error::open(&path, err))?;
            log::debug!("timer {name} writing to {}", path.display());
            self.timers.insert(
                name.to_string(),
                Timer {
                    _transport: transport,
                    engine,
                    start: None,
                },
            );
        }
        if let Some(timer) = self.timers.get_mut(name) {
            timer.start = Some(self.clock.now());
        }
        Ok(())
    }

    /// Record the time since the matching `start` as one step.
    ///
    /// A stop without a matching start is logged and ignored.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let Some(timer) = self.timers.get_mut(name) else {
            log::warn!("found stop without matching start for timer {name}");
            return Ok(());
        };
        let Some(start) = timer.start.take() else {
            log::warn!("found stop without matching start for timer {name}");
            return Ok(());
        };
        let stop = self.clock.now();
        let elapsed = self.clock.seconds_between(start, stop);
        timer.engine.begin_step(StepMode::Append, None)?;
        timer.engine.put(TIME_FIELD, Value::F64(elapsed))?;
        timer.engine.end_step()?;
        log::trace!("timer {name}: {elapsed:.6}s");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for (name, mut timer) in std::mem::take(&mut self.timers) {
            if timer.start.is_some() {
                log::debug!("timer {name} closed while running");
            }
            if let Err(err) = timer.engine.close() {
                log::error!("timer {name} failed to close: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
