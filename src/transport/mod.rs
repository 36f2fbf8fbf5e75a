//! The data-transport collaborator.
//!
//! The coupling layer never interprets array data or file formats. It
//! sequences calls against three seams:
//!
//! - [`TransportFactory`]: declares one [`Transport`] per group, applying
//!   the configured engine and parameters.
//! - [`Transport`]: per-group IO object; knows its engine type, the
//!   variables defined on it, and opens [`Engine`] handles.
//! - [`Engine`]: an open handle with typed put/get inside begin/end step.
//!
//! Two reference engines ship with the crate: a file-backed engine
//! ([`file`]) and an in-process streaming engine ([`stream`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ProcessGroup, Result};

pub mod capability;
pub mod file;
pub mod local;
pub mod stream;

pub use capability::{EngineTraits, TransportCapability};
pub use local::LocalTransports;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    pub fn is_write(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::Append)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    Append,
    Read,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// A step is open and may be accessed.
    Ready,
    /// No step arrived within the timeout; try again later.
    NotReady,
    /// The transport will never deliver another step.
    EndOfStream,
    /// A seek target will never be produced: the writer has finished.
    /// Engines never report this; the coupling layer derives it.
    Unreachable,
}

impl StepStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, StepStatus::Ready)
    }
}

/// A typed field value carried through a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    I64(i64),
    F64(f64),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match self {
            Value::F64Array(values) => Some(values),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Value::F64Array(values)
    }
}

impl From<Vec<i64>> for Value {
    fn from(values: Vec<i64>) -> Self {
        Value::I64Array(values)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

pub trait TransportFactory: Send {
    /// Declare the IO object for group `name`.
    fn declare(
        &self,
        name: &str,
        engine: Option<&str>,
        params: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Transport>>;
}

pub trait Transport: Send {
    fn engine_type(&self) -> &str;

    fn open(
        &mut self,
        path: &Path,
        mode: OpenMode,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Box<dyn Engine>>;

    fn define(&mut self, name: &str);

    fn is_defined(&self, name: &str) -> bool;

    /// Forget every defined variable and attribute.
    fn clear_metadata(&mut self);

    /// Files whose existence proves a writer has produced data at `path`.
    fn metadata_artifacts(&self, _path: &Path) -> Vec<PathBuf> {
        Vec::new()
    }
}

pub trait Engine: Send {
    fn begin_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepStatus>;

    fn end_step(&mut self) -> Result<()>;

    fn put(&mut self, name: &str, value: Value) -> Result<()>;

    /// Read a field of the current step; `None` if the writer did not put it.
    fn get(&mut self, name: &str) -> Result<Option<Value>>;

    fn close(&mut self) -> Result<()>;
}
