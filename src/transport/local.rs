use std::collections::BTreeMap;

use crate::core::{Error, Result};
use crate::transport::file::FileTransport;
use crate::transport::stream::{StreamHub, StreamTransport};
use crate::transport::{Transport, TransportFactory};

/// Engine used when a group names none.
pub const DEFAULT_ENGINE: &str = "bpfile";

const FILE_ENGINES: &[&str] = &["bpfile", "bp", "bp2", "bp3", "bp4", "hdf5"];
const STREAM_ENGINES: &[&str] = &["sst", "ssc", "insitumpi", "inline", "dataman"];

/// Factory for the engines that ship with the crate.
#[derive(Clone)]
pub struct LocalTransports {
    hub: StreamHub,
}

impl LocalTransports {
    pub fn new() -> Self {
        Self::with_hub(StreamHub::global())
    }

    /// Use a private hub; streams opened through it never meet the global one.
    pub fn with_hub(hub: StreamHub) -> Self {
        Self { hub }
    }
}

impl Default for LocalTransports {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for LocalTransports {
    fn declare(
        &self,
        name: &str,
        engine: Option<&str>,
        params: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Transport>> {
        let engine = engine.map(str::trim).unwrap_or(DEFAULT_ENGINE);
        let key = engine.to_ascii_lowercase();
        log::debug!("declaring group {name} on engine {engine}");
        if FILE_ENGINES.contains(&key.as_str()) {
            Ok(Box::new(FileTransport::new(name, engine, params)))
        } else if STREAM_ENGINES.contains(&key.as_str()) {
            Ok(Box::new(StreamTransport::new(
                name,
                engine,
                params,
                self.hub.clone(),
            )))
        } else {
            Err(Error::Config(format!(
                "group {name}: unknown engine {engine:?}"
            )))
        }
    }
}
