/// Engines whose readers only observe new steps by reopening the file.
const FILE_BACKED: &[&str] = &["bpfile", "bp", "bp3", "hdf5"];
/// Engines that publish metadata artifacts readers can wait on.
const METADATA_ENGINES: &[&str] = &["bpfile", "bp", "bp2", "bp3", "bp4", "hdf5"];

/// Whether a transport needs the sentinel protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportCapability {
    /// No native flow control: writer and readers coordinate via sentinels.
    FileBacked,
    /// Streaming with its own backpressure.
    SelfSynchronizing,
}

impl TransportCapability {
    pub fn classify(engine_type: &str) -> Self {
        if matches_any(engine_type, FILE_BACKED) {
            TransportCapability::FileBacked
        } else {
            TransportCapability::SelfSynchronizing
        }
    }

    pub fn requires_lock(&self) -> bool {
        matches!(self, TransportCapability::FileBacked)
    }
}

/// Everything the coupler derives from an engine type, resolved once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineTraits {
    pub capability: TransportCapability,
    /// Readers wait for metadata artifacts before opening.
    pub metadata_wait: bool,
}

impl EngineTraits {
    pub fn probe(engine_type: &str) -> Self {
        Self {
            capability: TransportCapability::classify(engine_type),
            metadata_wait: matches_any(engine_type, METADATA_ENGINES),
        }
    }

    pub fn requires_lock(&self) -> bool {
        self.capability.requires_lock()
    }
}

fn matches_any(engine_type: &str, names: &[&str]) -> bool {
    let engine_type = engine_type.trim();
    names
        .iter()
        .any(|name| name.eq_ignore_ascii_case(engine_type))
}
