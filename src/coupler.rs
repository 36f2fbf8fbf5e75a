//! Per-group coupling state machine.
//!
//! ```text
//! Constructed -> Initialized -> Opened <-> Closed -> Finalized
//! ```
//!
//! The first `open` fixes the role and probes the engine type once. Groups
//! on file-backed engines guard every engine open, writer end-of-step and
//! writer close with the sentinel critical section. Their readers always go
//! through step-seek and fully close the engine after each step, because
//! those formats only show new steps to a fresh open. Streaming groups open
//! once and rely on the engine's own flow control.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CodeTopology, GroupConfig};
use crate::core::wait::poll_until;
use crate::core::{Deadline, Error, ProcessGroup, Result};
use crate::lock::{CriticalSection, Filesystem, LocalFs, LockOptions, Role, SentinelPaths};
use crate::publisher::{GlobalStep, StepStamp};
use crate::transport::{
    Engine, EngineTraits, OpenMode, StepMode, StepStatus, Transport, Value,
};

/// Field carrying the writer's global step index in linked groups.
pub const LINKED_STEP_NUMBER: &str = "_StepNumber";
/// Field carrying the writer's global physical time in linked groups.
pub const LINKED_STEP_PHYSICAL: &str = "_StepPhysical";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Initialized,
    Opened,
    Closed,
    Finalized,
}

/// Process-wide pieces every coupler shares.
#[derive(Clone)]
pub struct CouplerContext {
    /// Relative filenames resolve against this directory.
    pub root: PathBuf,
    pub fs: Arc<dyn Filesystem>,
    pub topology: CodeTopology,
    pub lock: LockOptions,
    pub global_step: Arc<GlobalStep>,
}

impl CouplerContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fs: Arc::new(LocalFs),
            topology: CodeTopology::default(),
            lock: LockOptions::default(),
            global_step: Arc::new(GlobalStep::new()),
        }
    }

    pub fn with_topology(mut self, topology: CodeTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_global_step(mut self, global_step: Arc<GlobalStep>) -> Self {
        self.global_step = global_step;
        self
    }
}

pub struct Coupler {
    name: String,
    config: GroupConfig,
    context: CouplerContext,
    transport: Box<dyn Transport>,
    engine: Option<Box<dyn Engine>>,
    state: LifecycleState,
    mode: Option<OpenMode>,
    traits: Option<EngineTraits>,
    group: Option<Arc<dyn ProcessGroup>>,
    filename: Option<PathBuf>,
    sentinels: Option<SentinelPaths>,
    current_step: i64,
    step_open: bool,
    linked: Option<StepStamp>,
}

impl Coupler {
    pub fn new(
        name: impl Into<String>,
        config: GroupConfig,
        transport: Box<dyn Transport>,
        context: CouplerContext,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            context,
            transport,
            engine: None,
            state: LifecycleState::Constructed,
            mode: None,
            traits: None,
            group: None,
            filename: None,
            sentinels: None,
            current_step: -1,
            step_open: false,
            linked: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn mode(&self) -> Option<OpenMode> {
        self.mode
    }

    pub fn role(&self) -> Option<Role> {
        self.mode.map(|mode| {
            if mode.is_write() {
                Role::Writer
            } else {
                Role::Reader
            }
        })
    }

    /// Engine traits, known once the group is initialized.
    pub fn traits(&self) -> Option<EngineTraits> {
        self.traits
    }

    pub fn requires_lock(&self) -> bool {
        self.traits.is_some_and(|traits| traits.requires_lock())
    }

    /// Index of the step last begun; -1 before the first.
    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn sentinels(&self) -> Option<&SentinelPaths> {
        self.sentinels.as_ref()
    }

    /// Whether an engine handle is currently open.
    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    /// The writer's global step carried by the step last read, if any.
    pub fn linked_step(&self) -> Option<StepStamp> {
        self.linked
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Open the group's file for `mode` across `group`.
    ///
    /// `filename` is used unless the group's configuration overrides it.
    /// Readers of metadata-carrying engines block here until the writer has
    /// produced its first step.
    pub fn open(
        &mut self,
        filename: impl AsRef<Path>,
        mode: OpenMode,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.initialize(mode, group)?;
        if self.engine.is_some() {
            return Ok(());
        }
        let requested = self
            .config
            .filename
            .as_deref()
            .unwrap_or_else(|| filename.as_ref());
        let resolved = self.context.root.join(requested);
        self.sentinels = Some(SentinelPaths::derive(&resolved, &self.context.topology));
        self.filename = Some(resolved);
        self.couple_open(Deadline::never())?;
        if let Some(filename) = &self.filename {
            log::info!(
                "group {} opened {} ({:?}, lock: {})",
                self.name,
                filename.display(),
                mode,
                self.requires_lock()
            );
        }
        Ok(())
    }

    /// Fix role and capabilities; later calls only check consistency.
    fn initialize(&mut self, mode: OpenMode, group: Arc<dyn ProcessGroup>) -> Result<()> {
        if let Some(current) = self.mode {
            if current != mode {
                return Err(Error::InvalidState("group already opened in another mode"));
            }
            return Ok(());
        }
        let traits = EngineTraits::probe(self.transport.engine_type());
        self.mode = Some(mode);
        self.traits = Some(traits);
        self.group = Some(group.duplicate());
        self.state = LifecycleState::Initialized;
        log::debug!(
            "group {} initialized on {} as {:?} ({:?})",
            self.name,
            self.transport.engine_type(),
            mode,
            traits.capability
        );
        Ok(())
    }

    pub fn begin_step(&mut self, timeout: Option<Duration>) -> Result<StepStatus> {
        self.ensure_live()?;
        if self.step_open {
            return Err(Error::InvalidState("previous step not ended"));
        }
        match self.require_role()? {
            Role::Writer => {
                if self.engine.is_none() {
                    self.couple_open(Deadline::never())?;
                }
                let status = self.engine_mut()?.begin_step(StepMode::Append, timeout)?;
                self.mark_begun(status, self.current_step + 1);
                Ok(status)
            }
            Role::Reader if self.requires_lock() => self.seek(self.current_step + 1, timeout),
            Role::Reader => {
                if self.engine.is_none() && !self.couple_open(Deadline::after(timeout))? {
                    return Ok(StepStatus::NotReady);
                }
                let status = self.engine_mut()?.begin_step(StepMode::Read, timeout)?;
                self.mark_begun(status, self.current_step + 1);
                Ok(status)
            }
        }
    }

    /// Begin reading at an explicit step index.
    ///
    /// `Unreachable` means the writer finished without producing `index`.
    pub fn begin_step_at(&mut self, index: i64, timeout: Option<Duration>) -> Result<StepStatus> {
        self.ensure_live()?;
        if self.require_role()? != Role::Reader {
            return Err(Error::InvalidState("only readers seek"));
        }
        if index < 0 {
            return Err(Error::InvalidState("negative step index"));
        }
        if self.step_open {
            return Err(Error::InvalidState("previous step not ended"));
        }
        if self.requires_lock() {
            return self.seek(index, timeout);
        }
        if index <= self.current_step {
            return Err(Error::Unsupported("streaming readers cannot seek backwards"));
        }
        loop {
            let status = self.begin_step(timeout)?;
            if !status.is_ready() || self.current_step == index {
                return Ok(status);
            }
            self.engine_mut()?.end_step()?;
            self.step_open = false;
        }
    }

    fn mark_begun(&mut self, status: StepStatus, index: i64) {
        if status.is_ready() {
            self.current_step = self.current_step.max(index);
            self.step_open = true;
        }
    }

    /// Repeat file seeks until found; bounded timeouts try exactly once.
    fn seek(&mut self, index: i64, timeout: Option<Duration>) -> Result<StepStatus> {
        let strategy = self.context.lock.strategy;
        let mut attempt: u32 = 0;
        loop {
            let status = self.file_seek(index, timeout)?;
            match status {
                StepStatus::Ready | StepStatus::Unreachable => return Ok(status),
                _ if timeout.is_some() => return Ok(status),
                _ => {
                    strategy.pause(attempt, None);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One locked scan from the start of a fresh handle to step `index`.
    fn file_seek(&mut self, index: i64, timeout: Option<Duration>) -> Result<StepStatus> {
        if !self.wait_metadata(Deadline::after(timeout))? {
            return self.not_ready_or_unreachable();
        }
        let status = match self.guarded(Role::Reader, |coupler| coupler.scan_to(index, timeout)) {
            Ok(status) => status,
            Err(err) => {
                // A half-scanned handle would mislabel steps on the next seek.
                log::warn!("group {} seek to step {index} failed: {err}", self.name);
                self.reset_engine()?;
                return Err(err);
            }
        };
        if status.is_ready() {
            self.mark_begun(status, index);
            log::debug!("group {} found step {index}", self.name);
            return Ok(status);
        }
        log::debug!("group {} seek to step {index} stopped at {status:?}", self.name);
        self.reset_engine()?;
        self.not_ready_or_unreachable()
    }

    fn scan_to(&mut self, index: i64, timeout: Option<Duration>) -> Result<StepStatus> {
        if self.engine.is_none() {
            self.engine = Some(self.open_engine()?);
            self.state = LifecycleState::Opened;
        }
        let engine = self.engine_mut()?;
        let mut cursor: i64 = -1;
        loop {
            let status = engine.begin_step(StepMode::Read, timeout)?;
            if !status.is_ready() {
                return Ok(status);
            }
            cursor += 1;
            if cursor == index {
                return Ok(status);
            }
            engine.end_step()?;
        }
    }

    fn not_ready_or_unreachable(&self) -> Result<StepStatus> {
        let group = self.group()?;
        let paths = self.paths()?;
        let done = group.agree(group.is_root() && self.context.fs.exists(paths.done()));
        Ok(if done {
            StepStatus::Unreachable
        } else {
            StepStatus::NotReady
        })
    }

    pub fn put(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        if self.require_role()? != Role::Writer || !self.step_open {
            return Err(Error::InvalidState("put outside a write step"));
        }
        if !self.transport.is_defined(name) {
            self.transport.define(name);
        }
        self.engine_mut()?.put(name, value.into())
    }

    pub fn get(&mut self, name: &str) -> Result<Option<Value>> {
        if self.require_role()? != Role::Reader || !self.step_open {
            return Err(Error::InvalidState("get outside a read step"));
        }
        self.engine_mut()?.get(name)
    }

    pub fn end_step(&mut self) -> Result<()> {
        self.ensure_live()?;
        if !self.step_open {
            return Err(Error::InvalidState("end_step without begin_step"));
        }
        let role = self.require_role()?;
        match role {
            Role::Writer => self.stamp_linkage()?,
            Role::Reader => self.read_linkage()?,
        }
        self.guarded(role, |coupler| coupler.engine_mut()?.end_step())?;
        self.step_open = false;
        if role == Role::Reader && self.requires_lock() {
            self.reset_engine()?;
        }
        Ok(())
    }

    fn stamp_linkage(&mut self) -> Result<()> {
        if !self.config.step_linkage || !self.group()?.is_root() {
            return Ok(());
        }
        let Some(stamp) = self.context.global_step.get() else {
            return Ok(());
        };
        for field in [LINKED_STEP_NUMBER, LINKED_STEP_PHYSICAL] {
            if !self.transport.is_defined(field) {
                self.transport.define(field);
            }
        }
        let engine = self.engine_mut()?;
        engine.put(LINKED_STEP_NUMBER, Value::I64(stamp.index))?;
        engine.put(LINKED_STEP_PHYSICAL, Value::F64(stamp.physical))
    }

    fn read_linkage(&mut self) -> Result<()> {
        if !self.config.step_linkage {
            return Ok(());
        }
        let engine = self.engine_mut()?;
        let index = engine.get(LINKED_STEP_NUMBER)?.and_then(|value| value.as_i64());
        let physical = engine
            .get(LINKED_STEP_PHYSICAL)?
            .and_then(|value| value.as_f64());
        self.linked = index
            .zip(physical)
            .map(|(index, physical)| StepStamp { index, physical });
        Ok(())
    }

    /// Close the engine. Writers on file-backed engines close under the lock.
    pub fn close(&mut self) -> Result<()> {
        if self.engine.is_none() {
            if matches!(self.state, LifecycleState::Initialized | LifecycleState::Opened) {
                self.state = LifecycleState::Closed;
            }
            return Ok(());
        }
        if self.step_open {
            log::warn!("group {} closed inside an open step", self.name);
            self.step_open = false;
        }
        match self.require_role()? {
            Role::Writer => self.guarded(Role::Writer, Self::close_engine)?,
            Role::Reader => self.close_engine()?,
        }
        self.state = LifecycleState::Closed;
        log::debug!("group {} closed at step {}", self.name, self.current_step);
        Ok(())
    }

    /// Close for good; only process finalize gets here.
    pub fn finalize(&mut self) -> Result<()> {
        if self.state == LifecycleState::Finalized {
            return Ok(());
        }
        self.close()?;
        self.state = LifecycleState::Finalized;
        Ok(())
    }

    /// Close the handle and forget transport metadata so a reopen starts clean.
    pub fn reset_engine(&mut self) -> Result<()> {
        self.close_engine()?;
        self.transport.clear_metadata();
        self.state = LifecycleState::Closed;
        log::trace!("group {} handle reset", self.name);
        Ok(())
    }

    fn close_engine(&mut self) -> Result<()> {
        if let Some(mut engine) = self.engine.take() {
            engine.close()?;
        }
        Ok(())
    }

    /// Open protocol. Returns `false` if reader metadata did not appear in time.
    fn couple_open(&mut self, deadline: Deadline) -> Result<bool> {
        let role = self.require_role()?;
        if role == Role::Reader && !self.wait_metadata(deadline)? {
            return Ok(false);
        }
        let engine = self.guarded(role, Self::open_engine)?;
        self.engine = Some(engine);
        self.state = LifecycleState::Opened;
        Ok(true)
    }

    fn open_engine(&mut self) -> Result<Box<dyn Engine>> {
        let mode = match (self.mode, self.state) {
            // A writer coming back after close must not truncate its steps.
            (Some(mode), LifecycleState::Closed) if mode.is_write() => OpenMode::Append,
            (Some(mode), _) => mode,
            (None, _) => return Err(Error::InvalidState("group not opened")),
        };
        let group = self.group()?;
        let path = self
            .filename
            .clone()
            .ok_or(Error::InvalidState("group not opened"))?;
        log::debug!("group {} engine open {} ({mode:?})", self.name, path.display());
        self.transport
            .open(&path, mode, group)
            .map_err(|err| Error::open(&path, err))
    }

    /// Wait (rank 0 polls, everyone agrees) for the writer's metadata.
    fn wait_metadata(&self, deadline: Deadline) -> Result<bool> {
        if !self.traits.is_some_and(|traits| traits.metadata_wait) {
            return Ok(true);
        }
        let Some(filename) = &self.filename else {
            return Err(Error::InvalidState("group not opened"));
        };
        let artifacts = self.transport.metadata_artifacts(filename);
        if artifacts.is_empty() {
            return Ok(true);
        }
        let group = self.group()?;
        let outcome = if group.is_root() {
            let fs = &self.context.fs;
            poll_until(&self.context.lock.strategy, deadline, || {
                Ok(artifacts.iter().all(|artifact| fs.exists(artifact)))
            })
        } else {
            Ok(true)
        };
        let present = group.agree(matches!(outcome, Ok(true)));
        outcome?;
        if !present {
            log::trace!("group {} metadata not yet present", self.name);
        }
        Ok(present)
    }

    /// Run `f` inside the `role` critical section when the engine needs one.
    fn guarded<T, F>(&mut self, role: Role, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if !self.requires_lock() {
            return f(self);
        }
        let fs = Arc::clone(&self.context.fs);
        let group = self.group()?;
        let paths = self.paths()?.clone();
        let options = self.context.lock.clone();
        let section = CriticalSection::new(fs.as_ref(), group.as_ref(), &paths, &options);
        section.acquire(role)?;
        let outcome = f(self);
        let released = section.release(role);
        let value = outcome?;
        released?;
        Ok(value)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == LifecycleState::Finalized {
            return Err(Error::InvalidState("group finalized"));
        }
        Ok(())
    }

    fn require_role(&self) -> Result<Role> {
        self.role().ok_or(Error::InvalidState("group not opened"))
    }

    fn group(&self) -> Result<Arc<dyn ProcessGroup>> {
        self.group
            .clone()
            .ok_or(Error::InvalidState("group not opened"))
    }

    fn paths(&self) -> Result<&SentinelPaths> {
        self.sentinels
            .as_ref()
            .ok_or(Error::InvalidState("group not opened"))
    }

    fn engine_mut(&mut self) -> Result<&mut Box<dyn Engine>> {
        self.engine
            .as_mut()
            .ok_or(Error::InvalidState("engine not open"))
    }
}
