use std::path::Path;
use std::sync::Arc;

use coupler::transport::stream::StreamHub;
use coupler::transport::LocalTransports;
use coupler::{
    Coupling, GroupConfig, LifecycleState, OpenMode, Settings, SingleProcess, StepStatus, Value,
};
use tempfile::tempdir;

fn coupling(root: &Path, engine: &str, hub: &StreamHub) -> Coupling {
    let settings = Settings::new(root).with_group("G", GroupConfig::with_engine(engine));
    Coupling::init(settings, Arc::new(SingleProcess))
        .with_factory(LocalTransports::with_hub(hub.clone()))
}

fn produce(writer: &mut Coupling, steps: i64) {
    let group = writer.coupler_mut("G").expect("writer group");
    for step in 0..steps {
        assert!(group.begin_step(None).expect("begin").is_ready());
        group.put("step", step).expect("put");
        group.end_step().expect("end");
    }
}

/// Reads `steps` steps and records whether the handle was open after each
/// `begin_step` and after each `end_step`.
fn consume(reader: &mut Coupling, steps: i64) -> Vec<(bool, bool)> {
    let group = reader.coupler_mut("G").expect("reader group");
    (0..steps)
        .map(|step| {
            assert_eq!(group.begin_step(None).expect("begin"), StepStatus::Ready);
            let during = group.is_open();
            assert_eq!(group.get("step").expect("get"), Some(Value::I64(step)));
            group.end_step().expect("end");
            (during, group.is_open())
        })
        .collect()
}

#[test]
fn file_backed_reader_reopens_every_step() {
    let dir = tempdir().expect("tempdir");
    let hub = StreamHub::new();
    let mut writer = coupling(dir.path(), "bp3", &hub);
    writer.declare("G").expect("declare");
    writer.open("G", "G.bp", OpenMode::Write).expect("open writer");
    produce(&mut writer, 3);

    let mut reader = coupling(dir.path(), "bp3", &hub);
    reader.declare("G").expect("declare");
    let group = reader.open("G", "G.bp", OpenMode::Read).expect("open reader");
    assert!(group.requires_lock());
    assert!(group.is_open());

    let observed = consume(&mut reader, 3);
    assert_eq!(observed, vec![(true, false); 3]);
    let group = reader.coupler("G").expect("reader group");
    assert_eq!(group.state(), LifecycleState::Closed);
    assert_eq!(group.current_step(), 2);
}

#[test]
fn streaming_reader_keeps_its_handle() {
    let dir = tempdir().expect("tempdir");
    let hub = StreamHub::new();
    let mut reader = coupling(dir.path(), "SST", &hub);
    reader.declare("G").expect("declare");
    let group = reader.open("G", "G", OpenMode::Read).expect("open reader");
    assert!(!group.requires_lock());

    let mut writer = coupling(dir.path(), "SST", &hub);
    writer.declare("G").expect("declare");
    writer.open("G", "G", OpenMode::Write).expect("open writer");
    produce(&mut writer, 3);
    writer.finalize().expect("writer finalize");

    let observed = consume(&mut reader, 3);
    assert_eq!(observed, vec![(true, true); 3]);
    let group = reader.coupler_mut("G").expect("reader group");
    assert_eq!(group.state(), LifecycleState::Opened);
    assert_eq!(group.begin_step(None).expect("eos"), StepStatus::EndOfStream);
}

#[test]
fn live_metadata_engine_waits_without_locking() {
    let dir = tempdir().expect("tempdir");
    let hub = StreamHub::new();
    let mut writer = coupling(dir.path(), "bp4", &hub);
    writer.declare("G").expect("declare");
    writer.open("G", "G.bp", OpenMode::Write).expect("open writer");
    produce(&mut writer, 1);

    let mut reader = coupling(dir.path(), "bp4", &hub);
    reader.declare("G").expect("declare");
    let group = reader.open("G", "G.bp", OpenMode::Read).expect("open reader");
    assert!(!group.requires_lock());
    assert!(group.traits().expect("traits").metadata_wait);

    assert_eq!(consume(&mut reader, 1), vec![(true, true)]);
    produce(&mut writer, 2);
    let group = reader.coupler_mut("G").expect("reader group");
    // Same handle sees the second batch; its first step carries 0 again.
    assert!(group.begin_step(None).expect("live step").is_ready());
    assert_eq!(group.current_step(), 1);
    assert_eq!(group.get("step").expect("get"), Some(Value::I64(0)));
    group.end_step().expect("end");
    assert!(!dir.path().join("G.bp-busy-writer").exists());
}
