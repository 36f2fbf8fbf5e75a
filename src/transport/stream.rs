//! Reference in-process streaming engine.
//!
//! Writers and readers of the same path meet in a [`StreamHub`]. Every
//! reader registers a bounded channel when it opens; the writer's rank 0
//! sends each finished step to every registered reader, blocking while a
//! reader's queue is full. That blocking send is the engine's own flow
//! control, which is why these engines never need sentinel files.
//!
//! Only writer rank 0 publishes. Fields put on other writer ranks are
//! dropped, so multi-rank writers should gather to rank 0 first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::core::wait::poll_until;
use crate::core::{Deadline, Error, ProcessGroup, Result, WaitStrategy};
use crate::transport::{Engine, OpenMode, StepMode, StepStatus, Transport, Value};

const DEFAULT_QUEUE_LIMIT: usize = 4;

type Step = Arc<BTreeMap<String, Value>>;

#[derive(Default)]
struct Route {
    readers: Vec<(u64, Sender<Step>)>,
}

/// Meeting point for in-process streams, keyed by path.
#[derive(Clone, Default)]
pub struct StreamHub {
    routes: Arc<Mutex<HashMap<PathBuf, Route>>>,
    next_id: Arc<AtomicU64>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hub shared by every transport in this process.
    pub fn global() -> StreamHub {
        static HUB: OnceLock<StreamHub> = OnceLock::new();
        HUB.get_or_init(StreamHub::new).clone()
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<PathBuf, Route>> {
        // A panicking holder cannot leave a route half-updated.
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe(&self, path: &Path, queue_limit: usize) -> (u64, Receiver<Step>) {
        let (tx, rx) = if queue_limit == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(queue_limit)
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes()
            .entry(path.to_path_buf())
            .or_default()
            .readers
            .push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&self, path: &Path, id: u64) {
        if let Some(route) = self.routes().get_mut(path) {
            route.readers.retain(|(reader, _)| *reader != id);
        }
    }

    pub fn reader_count(&self, path: &Path) -> usize {
        self.routes()
            .get(path)
            .map_or(0, |route| route.readers.len())
    }

    /// Deliver `step` to every reader of `path`, dropping readers that left.
    fn publish(&self, path: &Path, step: Step) -> usize {
        let readers: Vec<(u64, Sender<Step>)> = self
            .routes()
            .get(path)
            .map(|route| route.readers.clone())
            .unwrap_or_default();
        let mut gone = Vec::new();
        for (id, tx) in &readers {
            if tx.send(Arc::clone(&step)).is_err() {
                gone.push(*id);
            }
        }
        if !gone.is_empty() {
            log::debug!("{} reader(s) of {} disconnected", gone.len(), path.display());
            if let Some(route) = self.routes().get_mut(path) {
                route.readers.retain(|(id, _)| !gone.contains(id));
            }
        }
        readers.len() - gone.len()
    }

    fn shut(&self, path: &Path) {
        self.routes().remove(path);
    }
}

pub struct StreamTransport {
    name: String,
    engine_type: String,
    params: BTreeMap<String, String>,
    defined: BTreeSet<String>,
    hub: StreamHub,
}

impl StreamTransport {
    pub fn new(
        name: &str,
        engine_type: &str,
        params: &BTreeMap<String, String>,
        hub: StreamHub,
    ) -> Self {
        Self {
            name: name.to_string(),
            engine_type: engine_type.to_string(),
            params: params.clone(),
            defined: BTreeSet::new(),
            hub,
        }
    }

    fn numeric_param(&self, key: &str) -> Result<Option<usize>> {
        self.params
            .get(key)
            .map(|value| {
                value.trim().parse::<usize>().map_err(|_| {
                    Error::Config(format!(
                        "group {}: parameter {key} must be a count, got {value:?}",
                        self.name
                    ))
                })
            })
            .transpose()
    }
}

impl Transport for StreamTransport {
    fn engine_type(&self) -> &str {
        &self.engine_type
    }

    fn open(
        &mut self,
        path: &Path,
        mode: OpenMode,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Box<dyn Engine>> {
        let path = path.to_path_buf();
        if mode.is_write() {
            let rendezvous = self.numeric_param("RendezvousReaderCount")?.unwrap_or(0);
            if group.is_root() && rendezvous > 0 {
                log::info!("{} waiting for {rendezvous} reader(s)", path.display());
                let hub = self.hub.clone();
                poll_until(&WaitStrategy::default(), Deadline::never(), || {
                    Ok(hub.reader_count(&path) >= rendezvous)
                })?;
            }
            group.barrier();
            Ok(Box::new(StreamEngine {
                hub: self.hub.clone(),
                path,
                group,
                side: Side::Writer { pending: None },
                closed: false,
            }))
        } else {
            let queue_limit = self
                .numeric_param("QueueLimit")?
                .unwrap_or(DEFAULT_QUEUE_LIMIT);
            let (id, rx) = self.hub.subscribe(&path, queue_limit);
            Ok(Box::new(StreamEngine {
                hub: self.hub.clone(),
                path,
                group,
                side: Side::Reader {
                    id,
                    rx,
                    current: None,
                },
                closed: false,
            }))
        }
    }

    fn define(&mut self, name: &str) {
        self.defined.insert(name.to_string());
    }

    fn is_defined(&self, name: &str) -> bool {
        self.defined.contains(name)
    }

    fn clear_metadata(&mut self) {
        self.defined.clear();
    }
}

enum Side {
    Writer {
        pending: Option<BTreeMap<String, Value>>,
    },
    Reader {
        id: u64,
        rx: Receiver<Step>,
        current: Option<Step>,
    },
}

pub struct StreamEngine {
    hub: StreamHub,
    path: PathBuf,
    group: Arc<dyn ProcessGroup>,
    side: Side,
    closed: bool,
}

impl Engine for StreamEngine {
    fn begin_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepStatus> {
        if self.closed {
            return Err(Error::InvalidState("engine closed"));
        }
        match (&mut self.side, mode) {
            (Side::Writer { pending }, StepMode::Append) => {
                if pending.is_some() {
                    return Err(Error::InvalidState("step already open"));
                }
                *pending = Some(BTreeMap::new());
                Ok(StepStatus::Ready)
            }
            (Side::Reader { rx, current, .. }, StepMode::Read) => {
                if current.is_some() {
                    return Err(Error::InvalidState("previous step not ended"));
                }
                let received = match timeout {
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    Some(limit) if limit.is_zero() => rx.try_recv().map_err(|err| match err {
                        TryRecvError::Empty => RecvTimeoutError::Timeout,
                        TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                    }),
                    Some(limit) => rx.recv_timeout(limit),
                };
                match received {
                    Ok(step) => {
                        *current = Some(step);
                        Ok(StepStatus::Ready)
                    }
                    Err(RecvTimeoutError::Timeout) => Ok(StepStatus::NotReady),
                    Err(RecvTimeoutError::Disconnected) => Ok(StepStatus::EndOfStream),
                }
            }
            _ => Err(Error::InvalidState("step mode does not match open mode")),
        }
    }

    fn end_step(&mut self) -> Result<()> {
        match &mut self.side {
            Side::Writer { pending } => {
                let values = pending
                    .take()
                    .ok_or(Error::InvalidState("end_step without begin_step"))?;
                if self.group.is_root() {
                    let delivered = self.hub.publish(&self.path, Arc::new(values));
                    log::trace!("{}: step sent to {delivered} reader(s)", self.path.display());
                }
                self.group.barrier();
                Ok(())
            }
            Side::Reader { current, .. } => current
                .take()
                .map(|_| ())
                .ok_or(Error::InvalidState("end_step without begin_step")),
        }
    }

    fn put(&mut self, name: &str, value: Value) -> Result<()> {
        match &mut self.side {
            Side::Writer {
                pending: Some(pending),
            } => {
                pending.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(Error::InvalidState("put outside a write step")),
        }
    }

    fn get(&mut self, name: &str) -> Result<Option<Value>> {
        match &self.side {
            Side::Reader {
                current: Some(step),
                ..
            } => Ok(step.get(name).cloned()),
            _ => Err(Error::InvalidState("get outside a read step")),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &self.side {
            Side::Writer { .. } => {
                self.group.barrier();
                if self.group.is_root() {
                    self.hub.shut(&self.path);
                }
            }
            Side::Reader { id, .. } => self.hub.unsubscribe(&self.path, *id),
        }
        Ok(())
    }
}
