//! The process-scoped coupling context.
//!
//! [`Coupling`] owns every [`Coupler`] of the process, the step publisher and
//! the timers. It is created once per process with [`Coupling::init`] and
//! consumed by [`Coupling::finalize`], which closes writers and leaves a
//! `.done` marker behind for each of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{GroupConfig, Settings};
use crate::core::{Clock, Error, ProcessGroup, QuantaClock, Result, SingleProcess};
use crate::coupler::{Coupler, CouplerContext, LifecycleState};
use crate::lock::{mark_done, Filesystem, LocalFs, Role};
use crate::publisher::{GlobalStep, StepPublisher, StepStamp};
use crate::timer::Timers;
use crate::transport::{LocalTransports, OpenMode, StepStatus, TransportFactory, Value};

/// Field written to a plot's `.done` group for each mapped step.
pub const PLOT_STEP_FIELD: &str = "Step";

pub struct Coupling {
    settings: Settings,
    factory: Box<dyn TransportFactory>,
    group: Arc<dyn ProcessGroup>,
    fs: Arc<dyn Filesystem>,
    couplers: BTreeMap<String, Coupler>,
    global_step: Arc<GlobalStep>,
    publisher: StepPublisher,
    timers: Timers,
}

impl Coupling {
    /// Start coupling for this process with the bundled engines.
    pub fn init(settings: Settings, group: Arc<dyn ProcessGroup>) -> Self {
        let publisher = StepPublisher::new(settings.step_group_name(), settings.root());
        let timers = Timers::new(settings.timing_dir(), Arc::new(QuantaClock::new()));
        log::info!(
            "coupling initialized for code {} (rank {} of {})",
            settings.topology().codename(),
            group.rank(),
            group.size()
        );
        Self {
            settings,
            factory: Box::new(LocalTransports::new()),
            group: group.duplicate(),
            fs: Arc::new(LocalFs),
            couplers: BTreeMap::new(),
            global_step: Arc::new(GlobalStep::new()),
            publisher,
            timers,
        }
    }

    pub fn with_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.timers.set_clock(clock);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    /// Declare `name` with its configured settings; idempotent.
    pub fn declare(&mut self, name: &str) -> Result<&mut Coupler> {
        let config = self.settings.group(name).cloned().unwrap_or_default();
        self.declare_with(name, config)
    }

    /// Declare `name` with explicit settings.
    ///
    /// A name that is already declared returns the existing coupler and the
    /// new settings are ignored. Names are not normalized: `"a"` and `"A "`
    /// are distinct groups.
    pub fn declare_with(&mut self, name: &str, config: GroupConfig) -> Result<&mut Coupler> {
        if !self.couplers.contains_key(name) {
            let transport = self
                .factory
                .declare(name, config.engine.as_deref(), &config.params)?;
            let context = CouplerContext {
                root: self.settings.root().to_path_buf(),
                fs: Arc::clone(&self.fs),
                topology: self.settings.topology().clone(),
                lock: self.settings.locking().options(),
                global_step: Arc::clone(&self.global_step),
            };
            log::debug!("declared group {name}");
            self.couplers
                .insert(name.to_string(), Coupler::new(name, config, transport, context));
        }
        self.coupler_mut(name)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.couplers.contains_key(name)
    }

    pub fn coupler(&self, name: &str) -> Result<&Coupler> {
        self.couplers
            .get(name)
            .ok_or_else(|| Error::UnknownGroup(name.to_string()))
    }

    pub fn coupler_mut(&mut self, name: &str) -> Result<&mut Coupler> {
        self.couplers
            .get_mut(name)
            .ok_or_else(|| Error::UnknownGroup(name.to_string()))
    }

    /// Open a declared group across the process group.
    pub fn open(
        &mut self,
        name: &str,
        filename: impl AsRef<Path>,
        mode: OpenMode,
    ) -> Result<&mut Coupler> {
        let group = Arc::clone(&self.group);
        self.open_with(name, filename, mode, group)
    }

    /// Open a declared group across `group` instead of the process group.
    pub fn open_with(
        &mut self,
        name: &str,
        filename: impl AsRef<Path>,
        mode: OpenMode,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<&mut Coupler> {
        let coupler = self.coupler_mut(name)?;
        coupler.open(filename, mode, group)?;
        Ok(coupler)
    }

    /// Publish this code's global step. Only rank 0 does anything.
    pub fn write_step(&mut self, physical: f64, index: i64) -> Result<()> {
        if !self.group.is_root() {
            return Ok(());
        }
        let stamp = StepStamp { index, physical };
        self.global_step.set(stamp);
        let config = self.settings.group(self.publisher.name());
        self.publisher.publish(self.factory.as_ref(), config, stamp)
    }

    /// The last step passed to [`Coupling::write_step`] on this rank.
    pub fn global_step(&self) -> Option<StepStamp> {
        self.global_step.get()
    }

    /// Where [`Coupling::write_step`] publishes.
    pub fn step_stream(&self) -> PathBuf {
        self.publisher.path()
    }

    pub fn start_timer(&mut self, name: &str) -> Result<()> {
        let group = Arc::clone(&self.group);
        self.timers.start(name, self.factory.as_ref(), group)
    }

    pub fn stop_timer(&mut self, name: &str) -> Result<()> {
        self.timers.stop(name)
    }

    /// Link plot output in `dir` to the writer step last read from `group`.
    ///
    /// Creates `<plot>-images/<step>/<codename>-<plot>` pointing at `dir` and
    /// announces the step through the `<plot>.done` group. Does nothing until
    /// `group` has carried a linked step.
    pub fn plot_map(&mut self, plot: &str, group: &str, dir: impl AsRef<Path>) -> Result<()> {
        let Some(stamp) = self.coupler(group)?.linked_step() else {
            log::debug!("plot {plot}: group {group} has no linked step yet");
            return Ok(());
        };
        let done_group = format!("{plot}.done");
        if !self.is_declared(&done_group) {
            self.declare(&done_group)?;
            let filename = format!("{done_group}.bp");
            self.open_with(&done_group, filename, OpenMode::Write, Arc::new(SingleProcess))?;
        }

        let images = self
            .settings
            .root()
            .join(format!("{plot}-images"))
            .join(stamp.index.to_string());
        std::fs::create_dir_all(&images)?;
        let link = images.join(format!("{}-{plot}", self.settings.topology().codename()));
        let target = absolute(dir.as_ref())?;
        if std::fs::symlink_metadata(&link).is_ok() {
            std::fs::remove_file(&link)?;
        }
        symlink(&target, &link)?;
        log::debug!("plot {plot} step {} -> {}", stamp.index, target.display());

        let coupler = self.coupler_mut(&done_group)?;
        if coupler.begin_step(None)? != StepStatus::Ready {
            return Err(Error::InvalidState("plot group refused a step"));
        }
        coupler.put(PLOT_STEP_FIELD, Value::I64(stamp.index))?;
        coupler.end_step()
    }

    /// Close every group, mark finished writers done and close the step
    /// stream and timers. Every resource is released even when one fails;
    /// the first failure is returned.
    pub fn finalize(mut self) -> Result<()> {
        let is_root = self.group.is_root();
        let mut first_err = None;
        for (name, coupler) in self.couplers.iter_mut() {
            let writer = coupler.role() == Some(Role::Writer)
                && coupler.state() != LifecycleState::Constructed;
            if let Err(err) = coupler.finalize() {
                log::error!("group {name} failed to finalize: {err}");
                first_err.get_or_insert(err);
                continue;
            }
            if writer && is_root {
                if let Some(filename) = coupler.filename() {
                    match mark_done(self.fs.as_ref(), filename, coupler.current_step()) {
                        Ok(()) => {
                            log::info!("group {name} done at step {}", coupler.current_step())
                        }
                        Err(err) => {
                            log::error!("group {name} done marker failed: {err}");
                            first_err.get_or_insert(err.into());
                        }
                    }
                }
            }
        }
        if is_root {
            if let Err(err) = self.publisher.close(self.fs.as_ref()) {
                log::error!("step stream failed to close: {err}");
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.timers.close() {
            log::error!("timers failed to close: {err}");
            first_err.get_or_insert(err);
        }
        match first_err {
            None => {
                log::info!("coupling finalized");
                Ok(())
            }
            Some(err) => Err(err),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(Error::Unsupported("plot links need symlink support"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stream::StreamHub;

    fn coupling(root: &Path) -> Coupling {
        Coupling::init(Settings::new(root), Arc::new(SingleProcess))
            .with_factory(LocalTransports::with_hub(StreamHub::new()))
    }

    #[test]
    fn declare_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut coupling = coupling(dir.path());
        coupling
            .declare_with("fields", GroupConfig::with_engine("sst"))
            .unwrap();
        let again = coupling
            .declare_with("fields", GroupConfig::with_engine("bp3"))
            .unwrap();
        assert_eq!(again.transport().engine_type(), "sst");
        assert!(coupling.is_declared("fields"));
        assert!(!coupling.is_declared("Fields"));
    }

    #[test]
    fn unknown_group_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut coupling = coupling(dir.path());
        let err = coupling
            .open("missing", "missing.bp", OpenMode::Write)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownGroup(name) if name == "missing"));
    }

    #[test]
    fn configured_filename_wins() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path())
            .with_group("fields", GroupConfig::default().filename("shared/fields.bp"));
        let mut coupling = Coupling::init(settings, Arc::new(SingleProcess))
            .with_factory(LocalTransports::with_hub(StreamHub::new()));
        coupling.declare("fields").unwrap();
        let coupler = coupling
            .open("fields", "ignored.bp", OpenMode::Write)
            .unwrap();
        assert_eq!(coupler.filename(), Some(dir.path().join("shared/fields.bp").as_path()));
    }

    #[test]
    fn finalize_marks_writers_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut coupling = coupling(dir.path());
        coupling.declare("out").unwrap();
        let writer = coupling.open("out", "out.bp", OpenMode::Write).unwrap();
        for value in 0..3_i64 {
            writer.begin_step(None).unwrap();
            writer.put("v", value).unwrap();
            writer.end_step().unwrap();
        }
        coupling.write_step(0.3, 3).unwrap();
        coupling.finalize().unwrap();

        let fs = LocalFs;
        assert_eq!(
            crate::lock::read_done(&fs, &dir.path().join("out.bp")),
            Some(Some(2))
        );
        assert_eq!(
            crate::lock::read_done(&fs, &dir.path().join("unknown-step")),
            Some(Some(3))
        );
    }

    #[cfg(unix)]
    #[test]
    fn plot_map_links_linked_steps() {
        let dir = tempfile::tempdir().unwrap();
        let hub = StreamHub::new();
        let linked = GroupConfig::with_engine("sst").linked();
        let settings = Settings::new(dir.path()).with_group("fields", linked);
        let mut reader = Coupling::init(settings.clone(), Arc::new(SingleProcess))
            .with_factory(LocalTransports::with_hub(hub.clone()));
        let mut writer = Coupling::init(settings, Arc::new(SingleProcess))
            .with_factory(LocalTransports::with_hub(hub));

        reader.declare("fields").unwrap();
        reader.open("fields", "fields", OpenMode::Read).unwrap();
        // Nothing read yet: no-op.
        reader.plot_map("density", "fields", dir.path()).unwrap();
        assert!(!dir.path().join("density-images").exists());

        writer.declare("fields").unwrap();
        writer.open("fields", "fields", OpenMode::Write).unwrap();
        writer.write_step(1.5, 7).unwrap();
        let out = writer.coupler_mut("fields").unwrap();
        out.begin_step(None).unwrap();
        out.put("rho", vec![1.0, 2.0]).unwrap();
        out.end_step().unwrap();

        let input = reader.coupler_mut("fields").unwrap();
        assert!(input.begin_step(None).unwrap().is_ready());
        input.end_step().unwrap();
        assert_eq!(
            input.linked_step(),
            Some(StepStamp {
                index: 7,
                physical: 1.5
            })
        );

        let plots = dir.path().join("plots");
        std::fs::create_dir_all(&plots).unwrap();
        reader.plot_map("density", "fields", &plots).unwrap();
        let link = dir.path().join("density-images/7/unknown-density");
        assert_eq!(std::fs::read_link(&link).unwrap(), plots);
        assert!(reader.is_declared("density.done"));

        writer.finalize().unwrap();
        reader.finalize().unwrap();
        let steps =
            crate::transport::file::read_all_steps(&dir.path().join("density.done.bp")).unwrap();
        assert_eq!(steps[0][PLOT_STEP_FIELD], Value::I64(7));
    }
}
