//! Reference file-backed engine.
//!
//! The data "file" is a directory:
//!
//! ```text
//! <path>/md.0                 created when a writer opens
//! <path>/md.idx               one "<step>\n" line per committed step
//! <path>/data.<step>.r<rank>.json
//!                             one block per writer rank: "crc32 <hex>\n<json>"
//! <path>/md.closed            writer closed, no more steps
//! ```
//!
//! Blocks are written to a temp name and renamed into place before rank 0
//! indexes the step, so an indexed step is always complete. Readers snapshot
//! `md.idx` when they open. Legacy formats never refresh that snapshot, which
//! is why coupled readers of those formats reopen every step; `bp4` refreshes
//! it while waiting for the next step.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::wait::poll_until;
use crate::core::{Deadline, Error, ProcessGroup, Result, WaitStrategy};
use crate::transport::{
    EngineTraits, Engine, OpenMode, StepMode, StepStatus, Transport, Value,
};

pub const INDEX_FILE: &str = "md.idx";
pub const META_FILE: &str = "md.0";
pub const CLOSED_FILE: &str = "md.closed";

const LIVE_ENGINE: &str = "bp4";

type StepBlock = BTreeMap<String, Value>;

pub struct FileTransport {
    name: String,
    engine_type: String,
    params: BTreeMap<String, String>,
    defined: BTreeSet<String>,
}

impl FileTransport {
    pub fn new(name: &str, engine_type: &str, params: &BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            engine_type: engine_type.to_string(),
            params: params.clone(),
            defined: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn poll_strategy(&self) -> WaitStrategy {
        match self
            .params
            .get("PollIntervalMs")
            .and_then(|value| value.parse::<u64>().ok())
        {
            Some(ms) => WaitStrategy::Sleep(Duration::from_millis(ms)),
            None => WaitStrategy::default(),
        }
    }
}

impl Transport for FileTransport {
    fn engine_type(&self) -> &str {
        &self.engine_type
    }

    fn open(
        &mut self,
        path: &Path,
        mode: OpenMode,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Box<dyn Engine>> {
        let live = self.engine_type.eq_ignore_ascii_case(LIVE_ENGINE);
        let engine = FileEngine::open(path, mode, group, live, self.poll_strategy())?;
        Ok(Box::new(engine))
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

    fn metadata_artifacts(&self, path: &Path) -> Vec<PathBuf> {
        if EngineTraits::probe(&self.engine_type).metadata_wait {
            vec![path.join(INDEX_FILE), path.join(META_FILE)]
        } else {
            Vec::new()
        }
    }
}

pub struct FileEngine {
    dir: PathBuf,
    mode: OpenMode,
    group: Arc<dyn ProcessGroup>,
    live: bool,
    strategy: WaitStrategy,
    /// Writer: next step to commit. Reader: next step to deliver.
    next_step: u64,
    /// Reader's snapshot of committed steps.
    available: u64,
    pending: Option<StepBlock>,
    current: Option<StepBlock>,
    closed: bool,
}

impl FileEngine {
    pub fn open(
        path: &Path,
        mode: OpenMode,
        group: Arc<dyn ProcessGroup>,
        live: bool,
        strategy: WaitStrategy,
    ) -> Result<Self> {
        let dir = path.to_path_buf();
        let mut engine = Self {
            dir,
            mode,
            group,
            live,
            strategy,
            next_step: 0,
            available: 0,
            pending: None,
            current: None,
            closed: false,
        };
        match mode {
            OpenMode::Write => {
                engine.on_root(|dir| {
                    if dir.exists() {
                        fs::remove_dir_all(dir)?;
                    }
                    fs::create_dir_all(dir)?;
                    File::create(dir.join(META_FILE))?;
                    Ok(())
                })?;
            }
            OpenMode::Append => {
                engine.on_root(|dir| {
                    fs::create_dir_all(dir)?;
                    remove_if_present(&dir.join(CLOSED_FILE))?;
                    if !dir.join(META_FILE).exists() {
                        File::create(dir.join(META_FILE))?;
                    }
                    Ok(())
                })?;
                engine.next_step = count_indexed(&engine.dir)?;
            }
            OpenMode::Read => {
                if !engine.dir.is_dir() {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::NotFound,
                        format!("{} does not exist", engine.dir.display()),
                    )));
                }
                engine.available = count_indexed(&engine.dir)?;
            }
        }
        log::debug!(
            "file engine opened {} ({:?}, {} steps visible)",
            engine.dir.display(),
            mode,
            engine.available.max(engine.next_step)
        );
        Ok(engine)
    }

    /// Run `f` on rank 0 only; every rank learns whether it worked.
    fn on_root<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let outcome = if self.group.is_root() {
            f(self.dir.as_path())
        } else {
            Ok(())
        };
        let agreed = self.group.agree(outcome.is_ok());
        outcome?;
        if !agreed {
            return Err(Error::InvalidState("rank 0 failed to prepare file output"));
        }
        Ok(())
    }

    fn begin_write(&mut self) -> Result<StepStatus> {
        if self.pending.is_some() {
            return Err(Error::InvalidState("step already open"));
        }
        self.pending = Some(StepBlock::new());
        Ok(StepStatus::Ready)
    }

    fn begin_read(&mut self, timeout: Option<Duration>) -> Result<StepStatus> {
        if self.current.is_some() {
            return Err(Error::InvalidState("previous step not ended"));
        }
        if self.next_step >= self.available {
            if !self.live {
                return Ok(StepStatus::EndOfStream);
            }
            let dir = self.dir.clone();
            let wanted = self.next_step;
            let mut seen = self.available;
            poll_until(&self.strategy, Deadline::after(timeout), || {
                seen = count_indexed(&dir)?;
                Ok(seen > wanted || dir.join(CLOSED_FILE).exists())
            })?;
            self.available = count_indexed(&self.dir)?.max(seen);
            if self.next_step >= self.available {
                return Ok(if self.dir.join(CLOSED_FILE).exists() {
                    StepStatus::EndOfStream
                } else {
                    StepStatus::NotReady
                });
            }
        }
        self.current = Some(load_step(&self.dir, self.next_step)?);
        self.next_step += 1;
        Ok(StepStatus::Ready)
    }

    fn commit(&mut self) -> Result<()> {
        let values = self
            .pending
            .take()
            .ok_or(Error::InvalidState("end_step without begin_step"))?;
        let step = self.next_step;
        write_block(&self.dir, step, self.group.rank(), &values)?;
        self.group.barrier();
        if self.group.is_root() {
            let mut index = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(INDEX_FILE))?;
            index.write_all(format!("{step}\n").as_bytes())?;
            index.sync_data()?;
        }
        self.next_step += 1;
        Ok(())
    }
}

impl Engine for FileEngine {
    fn begin_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepStatus> {
        if self.closed {
            return Err(Error::InvalidState("engine closed"));
        }
        match (self.mode.is_write(), mode) {
            (true, StepMode::Append) => self.begin_write(),
            (false, StepMode::Read) => self.begin_read(timeout),
            _ => Err(Error::InvalidState("step mode does not match open mode")),
        }
    }

    fn end_step(&mut self) -> Result<()> {
        if self.mode.is_write() {
            self.commit()
        } else {
            self.current
                .take()
                .map(|_| ())
                .ok_or(Error::InvalidState("end_step without begin_step"))
        }
    }

    fn put(&mut self, name: &str, value: Value) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or(Error::InvalidState("put outside a write step"))?;
        pending.insert(name.to_string(), value);
        Ok(())
    }

    fn get(&mut self, name: &str) -> Result<Option<Value>> {
        let current = self
            .current
            .as_ref()
            .ok_or(Error::InvalidState("get outside a read step"))?;
        Ok(current.get(name).cloned())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        if self.mode.is_write() {
            if self.pending.take().is_some() {
                log::warn!("closing {} with an unfinished step", self.dir.display());
            }
            self.on_root(|dir| {
                File::create(dir.join(CLOSED_FILE))?;
                Ok(())
            })?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Committed steps in `dir`; a torn trailing line does not count.
pub fn count_indexed(dir: &Path) -> Result<u64> {
    let contents = match fs::read_to_string(dir.join(INDEX_FILE)) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(Error::Io(err)),
    };
    Ok(contents
        .split_inclusive('\n')
        .filter(|line| line.ends_with('\n'))
        .count() as u64)
}

fn block_path(dir: &Path, step: u64, rank: usize) -> PathBuf {
    dir.join(format!("data.{step}.r{rank}.json"))
}

/// Rank of a block filename belonging to `step`.
fn parse_block_rank(name: &str, step: u64) -> Option<usize> {
    let rest = name.strip_prefix(&format!("data.{step}.r"))?;
    rest.strip_suffix(".json")?.parse::<usize>().ok()
}

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn write_block(dir: &Path, step: u64, rank: usize, values: &StepBlock) -> Result<()> {
    let payload = serde_json::to_vec(values)?;
    let final_path = block_path(dir, step, rank);
    let temp_path = final_path.with_extension("json.tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(format!("crc32 {:08x}\n", crc32(&payload)).as_bytes())?;
    file.write_all(&payload)?;
    file.sync_all()?;
    fs::rename(&temp_path, &final_path)?;
    Ok(())
}

fn read_block(path: &Path) -> Result<StepBlock> {
    let bytes = fs::read(path)?;
    let split = bytes
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or(Error::Corrupt("block header missing"))?;
    let header = std::str::from_utf8(&bytes[..split])
        .map_err(|_| Error::Corrupt("block header not utf-8"))?;
    let expected = header
        .strip_prefix("crc32 ")
        .and_then(|hex| u32::from_str_radix(hex.trim(), 16).ok())
        .ok_or(Error::Corrupt("block header malformed"))?;
    let payload = &bytes[split + 1..];
    if crc32(payload) != expected {
        return Err(Error::Corrupt("block crc mismatch"));
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Merge every rank's block of `step`; lower ranks win on name clashes.
fn load_step(dir: &Path, step: u64) -> Result<StepBlock> {
    let mut blocks = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(rank) = name.to_str().and_then(|name| parse_block_rank(name, step)) else {
            continue;
        };
        blocks.push((rank, entry.path()));
    }
    if blocks.is_empty() {
        return Err(Error::Corrupt("indexed step has no data blocks"));
    }
    blocks.sort_unstable_by_key(|(rank, _)| *rank);
    let mut merged = StepBlock::new();
    for (_, path) in blocks {
        for (name, value) in read_block(&path)? {
            merged.entry(name).or_insert(value);
        }
    }
    Ok(merged)
}

/// Every committed step under `dir`, oldest first.
pub fn read_all_steps(dir: &Path) -> Result<Vec<StepBlock>> {
    (0..count_indexed(dir)?)
        .map(|step| load_step(dir, step))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SingleProcess, ThreadGroup};

    fn open(path: &Path, mode: OpenMode, live: bool) -> FileEngine {
        FileEngine::open(
            path,
            mode,
            Arc::new(SingleProcess),
            live,
            WaitStrategy::Sleep(Duration::from_millis(1)),
        )
        .unwrap()
    }

    fn write_steps(path: &Path, values: &[f64]) -> FileEngine {
        let mut writer = open(path, OpenMode::Write, false);
        for value in values {
            writer.begin_step(StepMode::Append, None).unwrap();
            writer.put("x", Value::F64(*value)).unwrap();
            writer.end_step().unwrap();
        }
        writer
    }

    #[test]
    fn writer_publishes_metadata_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bp");
        let mut writer = open(&path, OpenMode::Write, false);
        assert!(path.join(META_FILE).exists());
        assert!(!path.join(INDEX_FILE).exists());

        writer.begin_step(StepMode::Append, None).unwrap();
        writer.put("x", Value::I64(1)).unwrap();
        writer.end_step().unwrap();
        assert_eq!(count_indexed(&path).unwrap(), 1);

        writer.close().unwrap();
        assert!(path.join(CLOSED_FILE).exists());
    }

    #[test]
    fn legacy_reader_sees_only_its_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bp");
        let mut writer = write_steps(&path, &[0.5]);

        let mut reader = open(&path, OpenMode::Read, false);
        writer.begin_step(StepMode::Append, None).unwrap();
        writer.put("x", Value::F64(1.5)).unwrap();
        writer.end_step().unwrap();

        assert_eq!(reader.begin_step(StepMode::Read, None).unwrap(), StepStatus::Ready);
        assert_eq!(reader.get("x").unwrap(), Some(Value::F64(0.5)));
        assert_eq!(reader.get("y").unwrap(), None);
        reader.end_step().unwrap();
        assert_eq!(
            reader.begin_step(StepMode::Read, Some(Duration::ZERO)).unwrap(),
            StepStatus::EndOfStream
        );

        let mut fresh = open(&path, OpenMode::Read, false);
        let steps: Vec<_> = (0..2)
            .map(|_| {
                assert!(fresh.begin_step(StepMode::Read, None).unwrap().is_ready());
                let value = fresh.get("x").unwrap();
                fresh.end_step().unwrap();
                value
            })
            .collect();
        assert_eq!(steps, vec![Some(Value::F64(0.5)), Some(Value::F64(1.5))]);
    }

    #[test]
    fn live_reader_refreshes_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bp");
        let mut writer = write_steps(&path, &[1.0]);

        let mut reader = open(&path, OpenMode::Read, true);
        assert!(reader.begin_step(StepMode::Read, None).unwrap().is_ready());
        reader.end_step().unwrap();
        assert_eq!(
            reader.begin_step(StepMode::Read, Some(Duration::from_millis(5))).unwrap(),
            StepStatus::NotReady
        );

        writer.begin_step(StepMode::Append, None).unwrap();
        writer.put("x", Value::F64(2.0)).unwrap();
        writer.end_step().unwrap();
        assert!(reader
            .begin_step(StepMode::Read, Some(Duration::from_millis(100)))
            .unwrap()
            .is_ready());
        assert_eq!(reader.get("x").unwrap(), Some(Value::F64(2.0)));
        reader.end_step().unwrap();

        writer.close().unwrap();
        assert_eq!(
            reader.begin_step(StepMode::Read, None).unwrap(),
            StepStatus::EndOfStream
        );
    }

    #[test]
    fn append_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bp");
        write_steps(&path, &[1.0, 2.0]).close().unwrap();

        let mut writer = open(&path, OpenMode::Append, false);
        assert!(!path.join(CLOSED_FILE).exists());
        writer.begin_step(StepMode::Append, None).unwrap();
        writer.put("x", Value::F64(3.0)).unwrap();
        writer.end_step().unwrap();

        let steps = read_all_steps(&path).unwrap();
        let xs: Vec<_> = steps.iter().map(|step| step["x"].as_f64()).collect();
        assert_eq!(xs, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn corrupted_block_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bp");
        write_steps(&path, &[1.0]);
        let block = block_path(&path, 0, 0);
        let mut bytes = fs::read(&block).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        fs::write(&block, bytes).unwrap();

        let mut reader = open(&path, OpenMode::Read, false);
        assert!(matches!(
            reader.begin_step(StepMode::Read, None),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn torn_index_line_is_not_a_step() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(INDEX_FILE), "0\n1\n2").unwrap();
        assert_eq!(count_indexed(dir.path()).unwrap(), 2);
    }

    #[test]
    fn ranks_write_separate_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bp");
        let handles: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|member| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let rank = member.rank() as i64;
                    let mut writer = FileEngine::open(
                        &path,
                        OpenMode::Write,
                        Arc::new(member),
                        false,
                        WaitStrategy::default(),
                    )
                    .unwrap();
                    writer.begin_step(StepMode::Append, None).unwrap();
                    writer.put("shared", Value::I64(rank)).unwrap();
                    writer.put(&format!("rank{rank}"), Value::I64(rank)).unwrap();
                    writer.end_step().unwrap();
                    writer.close().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let steps = read_all_steps(&path).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0]["shared"], Value::I64(0));
        assert_eq!(steps[0]["rank1"], Value::I64(1));
    }
}
