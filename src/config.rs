//! Run configuration.
//!
//! Resolved once at startup from two YAML files written by the workflow
//! composer next to the running code:
//!
//! - `.coupler-groups-<N>.yaml`: per-group engine settings and the
//!   step-linkage flag, plus reserved `.timingdir` / `.locking` keys.
//! - `.coupler-codenames-<N>.yaml`: this code's name and every code that
//!   may read its groups.
//!
//! `<N>` comes from the `COUPLER_NUM` environment variable. Missing files
//! mean "no overrides": every lookup falls back to caller defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::{Result, WaitStrategy};
use crate::lock::LockOptions;

pub const RUN_INDEX_ENV: &str = "COUPLER_NUM";
const TIMING_DIR_KEY: &str = ".timingdir";
const LOCKING_KEY: &str = ".locking";
const UNKNOWN_CODE: &str = "unknown";

/// Static settings for one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Overrides the filename the code passes to `open`.
    #[serde(default)]
    pub filename: Option<PathBuf>,
    /// Transport engine name; `None` uses the transport's default.
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default, deserialize_with = "stringify_params")]
    pub params: BTreeMap<String, String>,
    /// Carry the process-wide step number inside this group.
    #[serde(rename = "AddStep", default)]
    pub step_linkage: bool,
}

impl GroupConfig {
    pub fn with_engine(engine: impl Into<String>) -> Self {
        Self {
            engine: Some(engine.into()),
            ..Self::default()
        }
    }

    pub fn filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn linked(mut self) -> Self {
        self.step_linkage = true;
        self
    }
}

fn stringify_params<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, scalar_to_string(&value)))
        .collect())
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(text) => text.clone(),
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Which codes take part in coupling and under which name this one reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeTopology {
    codename: String,
    codes: Vec<String>,
    reader_id: String,
    configured: bool,
}

impl Default for CodeTopology {
    fn default() -> Self {
        Self {
            codename: UNKNOWN_CODE.to_string(),
            codes: Vec::new(),
            reader_id: String::new(),
            configured: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CodesFile {
    codename: String,
    #[serde(default)]
    codes: Vec<String>,
}

impl CodeTopology {
    /// A topology naming this code and every code that may read.
    pub fn new(codename: impl Into<String>, codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            codename: codename.into(),
            codes: codes.into_iter().map(Into::into).collect(),
            reader_id: String::new(),
            configured: true,
        }
    }

    pub fn with_reader_id(mut self, reader_id: impl Into<String>) -> Self {
        self.reader_id = reader_id.into();
        self
    }

    pub fn codename(&self) -> &str {
        &self.codename
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Suffix of this code's reader-busy sentinel.
    pub fn own_reader_suffix(&self) -> String {
        if self.configured {
            reader_suffix(Some(&self.codename), &self.reader_id)
        } else {
            reader_suffix(None, &self.reader_id)
        }
    }

    /// Suffixes of every reader-busy sentinel a writer must wait on.
    pub fn reader_suffixes(&self) -> Vec<String> {
        if self.configured {
            self.codes
                .iter()
                .map(|code| reader_suffix(Some(code), &self.reader_id))
                .collect()
        } else {
            vec![self.own_reader_suffix()]
        }
    }
}

pub const WRITER_SUFFIX: &str = "-busy-writer";
const READER_SUFFIX: &str = "-busy-reader";

fn reader_suffix(code: Option<&str>, reader_id: &str) -> String {
    match code {
        Some(code) => format!("{READER_SUFFIX}-{code}{reader_id}"),
        None => format!("{READER_SUFFIX}{reader_id}"),
    }
}

/// Tuning for the sentinel lock protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Sleep between polls once spinning is exhausted.
    pub poll_interval_us: u64,
    /// Polls that only yield before sleeping starts.
    pub spin_polls: u32,
    /// Give up a lock wait after this long. Absent waits forever.
    pub lock_timeout_ms: Option<u64>,
    /// How many times a reader re-checks the writer sentinel after
    /// creating its own.
    pub verify_checks: u32,
    /// Reader acquire restarts allowed before reporting a stall.
    pub max_reader_restarts: u32,
    /// Remove sentinels whose recorded owner process is gone.
    pub reclaim_stale: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 1_000,
            spin_polls: 64,
            lock_timeout_ms: None,
            verify_checks: 3,
            max_reader_restarts: 1_024,
            reclaim_stale: false,
        }
    }
}

impl LockConfig {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            strategy: WaitStrategy::SpinThenSleep {
                spins: self.spin_polls,
                sleep: Duration::from_micros(self.poll_interval_us),
            },
            timeout: self.lock_timeout_ms.map(Duration::from_millis),
            verify_checks: self.verify_checks,
            max_reader_restarts: self.max_reader_restarts,
            reclaim_stale: self.reclaim_stale,
        }
    }
}

/// Everything resolved at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    root: PathBuf,
    groups: BTreeMap<String, GroupConfig>,
    timing_dir: PathBuf,
    locking: LockConfig,
    topology: CodeTopology,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            groups: BTreeMap::new(),
            timing_dir: PathBuf::from("."),
            locking: LockConfig::default(),
            topology: CodeTopology::default(),
        }
    }
}

impl Settings {
    /// Settings rooted at `root` with no overrides.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            timing_dir: root.clone(),
            root,
            ..Self::default()
        }
    }

    /// Load from the current directory using `COUPLER_NUM`.
    pub fn from_env() -> Result<Self> {
        match std::env::var(RUN_INDEX_ENV) {
            Ok(num) => Self::load(".", &num),
            Err(_) => {
                log::debug!("{RUN_INDEX_ENV} not set, using default settings");
                Ok(Self::default())
            }
        }
    }

    /// Load the config files for run index `num` found in `root`.
    pub fn load(root: impl Into<PathBuf>, num: &str) -> Result<Self> {
        let mut settings = Self::new(root);
        let groups_path = settings.root.join(format!(".coupler-groups-{num}.yaml"));
        if groups_path.exists() {
            log::info!("loading group settings from {}", groups_path.display());
            settings.apply_groups(&std::fs::read_to_string(&groups_path)?)?;
        }
        let codes_path = settings.root.join(format!(".coupler-codenames-{num}.yaml"));
        if codes_path.exists() {
            log::info!("loading code topology from {}", codes_path.display());
            settings.topology = parse_codes(&std::fs::read_to_string(&codes_path)?)?;
        }
        Ok(settings)
    }

    fn apply_groups(&mut self, text: &str) -> Result<()> {
        let raw: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(text)?;
        for (name, value) in raw.unwrap_or_default() {
            match name.as_str() {
                TIMING_DIR_KEY => {
                    let dir = value.as_str().ok_or_else(|| {
                        crate::core::Error::Config(format!("{TIMING_DIR_KEY} must be a string"))
                    })?;
                    self.timing_dir = self.root.join(dir);
                }
                LOCKING_KEY => {
                    self.locking = serde_yaml::from_value(value)?;
                }
                reserved if reserved.starts_with('.') => {
                    log::debug!("ignoring reserved key {reserved}");
                }
                _ => {
                    let config: GroupConfig = serde_yaml::from_value(value)?;
                    self.groups.insert(name, config);
                }
            }
        }
        Ok(())
    }

    pub fn with_group(mut self, name: impl Into<String>, config: GroupConfig) -> Self {
        self.groups.insert(name.into(), config);
        self
    }

    pub fn with_topology(mut self, topology: CodeTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_locking(mut self, locking: LockConfig) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_timing_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.timing_dir = self.root.join(dir);
        self
    }

    /// Distinguish several reader instances of the same code.
    pub fn with_reader_id(mut self, reader_id: impl Into<String>) -> Self {
        self.topology = self.topology.with_reader_id(reader_id);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &GroupConfig)> {
        self.groups.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn timing_dir(&self) -> &Path {
        &self.timing_dir
    }

    pub fn locking(&self) -> &LockConfig {
        &self.locking
    }

    pub fn topology(&self) -> &CodeTopology {
        &self.topology
    }

    /// Name of the group carrying this code's published steps.
    pub fn step_group_name(&self) -> String {
        format!("{}-step", self.topology.codename())
    }
}

fn parse_codes(text: &str) -> Result<CodeTopology> {
    let file: CodesFile = serde_yaml::from_str(text)?;
    Ok(CodeTopology::new(file.codename, file.codes))
}
