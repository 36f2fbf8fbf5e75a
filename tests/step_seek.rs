use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coupler::{
    CodeTopology, Coupling, GroupConfig, OpenMode, Settings, SingleProcess, StepStamp,
    StepStatus, Value,
};
use tempfile::tempdir;

fn settings(root: &Path, codename: &str) -> Settings {
    Settings::new(root)
        .with_group("G", GroupConfig::with_engine("bpfile").linked())
        .with_topology(CodeTopology::new(codename, ["R"]))
}

fn writer(root: &Path) -> Coupling {
    let mut coupling = Coupling::init(settings(root, "W"), Arc::new(SingleProcess));
    coupling.declare("G").expect("declare writer");
    coupling
        .open("G", "G.bp", OpenMode::Write)
        .expect("open writer");
    coupling
}

fn reader(root: &Path) -> Coupling {
    let mut coupling = Coupling::init(settings(root, "R"), Arc::new(SingleProcess));
    coupling.declare("G").expect("declare reader");
    coupling
        .open("G", "G.bp", OpenMode::Read)
        .expect("open reader");
    coupling
}

fn write_step(coupling: &mut Coupling, index: i64, physical: f64) {
    coupling.write_step(physical, index).expect("write step");
    let group = coupling.coupler_mut("G").expect("writer group");
    assert_eq!(group.begin_step(None).expect("begin"), StepStatus::Ready);
    group.put("density", vec![physical; 4]).expect("put");
    group.end_step().expect("end");
}

#[test]
fn seek_reports_not_ready_then_unreachable() {
    let dir = tempdir().expect("tempdir");
    let mut producer = writer(dir.path());
    for (index, physical) in [(0, 0.0), (1, 0.1), (2, 0.2)] {
        write_step(&mut producer, index, physical);
    }

    let mut consumer = reader(dir.path());
    let group = consumer.coupler_mut("G").expect("reader group");
    for (index, physical) in [(0, 0.0), (1, 0.1), (2, 0.2)] {
        assert_eq!(group.begin_step_at(index, None).expect("seek"), StepStatus::Ready);
        let density = group.get("density").expect("get").expect("density present");
        assert_eq!(density.as_f64_slice(), Some(&[physical; 4][..]));
        group.end_step().expect("end");
        assert_eq!(group.linked_step(), Some(StepStamp { index, physical }));
    }

    assert_eq!(
        group.begin_step_at(3, Some(Duration::ZERO)).expect("seek 3"),
        StepStatus::NotReady
    );

    producer.finalize().expect("writer finalize");
    assert!(dir.path().join("G.bp.done").exists());

    let group = consumer.coupler_mut("G").expect("reader group");
    assert_eq!(
        group.begin_step_at(3, Some(Duration::ZERO)).expect("seek 3 after done"),
        StepStatus::Unreachable
    );
    // An unbounded seek must not hang once the writer is done.
    assert_eq!(
        group.begin_step_at(3, None).expect("blocking seek after done"),
        StepStatus::Unreachable
    );
    assert_eq!(group.current_step(), 2);
    consumer.finalize().expect("reader finalize");
}

#[test]
fn blocking_seek_waits_for_a_live_writer() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let mut producer = writer(&root);
    write_step(&mut producer, 0, 0.0);

    let handle = thread::spawn(move || {
        for index in 1..5 {
            thread::sleep(Duration::from_millis(5));
            write_step(&mut producer, index, index as f64 * 0.5);
        }
        producer.finalize().expect("writer finalize");
    });

    let mut consumer = reader(dir.path());
    let group = consumer.coupler_mut("G").expect("reader group");
    let mut seen = Vec::new();
    loop {
        match group.begin_step(None).expect("begin") {
            StepStatus::Ready => {
                group.end_step().expect("end");
                seen.push(group.linked_step().expect("linked step").index);
            }
            StepStatus::Unreachable => break,
            other => panic!("unexpected status {other:?}"),
        }
    }
    handle.join().expect("writer thread");
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    let published = coupler::transport::file::read_all_steps(&dir.path().join("W-step.bp"))
        .expect("step stream");
    let physical: Vec<_> = published
        .iter()
        .map(|step| step["StepPhysical"].clone())
        .collect();
    assert_eq!(
        physical,
        vec![
            Value::F64(0.0),
            Value::F64(0.5),
            Value::F64(1.0),
            Value::F64(1.5),
            Value::F64(2.0)
        ]
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("W-step.done")).expect("step done"),
        "4"
    );
}

#[test]
fn unlinked_steps_clear_the_linked_step() {
    let dir = tempdir().expect("tempdir");
    let mut producer = writer(dir.path());
    // No global step yet: nothing is stamped.
    let group = producer.coupler_mut("G").expect("writer group");
    group.begin_step(None).expect("begin");
    group.put("density", 1.0).expect("put");
    group.end_step().expect("end");
    write_step(&mut producer, 9, 0.9);

    let mut consumer = reader(dir.path());
    let group = consumer.coupler_mut("G").expect("reader group");
    assert!(group.begin_step(None).expect("step 0").is_ready());
    group.end_step().expect("end 0");
    assert_eq!(group.linked_step(), None);
    assert!(group.begin_step(None).expect("step 1").is_ready());
    group.end_step().expect("end 1");
    assert_eq!(
        group.linked_step(),
        Some(StepStamp {
            index: 9,
            physical: 0.9
        })
    );
}

#[test]
fn failed_seek_rescans_from_a_fresh_handle() {
    let dir = tempdir().expect("tempdir");
    let mut producer = writer(dir.path());
    let group = producer.coupler_mut("G").expect("writer group");
    for value in 0..4_i64 {
        group.begin_step(None).expect("begin");
        group.put("v", value).expect("put");
        group.end_step().expect("end");
    }

    let block = dir.path().join("G.bp").join("data.1.r0.json");
    let pristine = std::fs::read(&block).expect("read block");
    let mut damaged = pristine.clone();
    let last = damaged.len() - 1;
    damaged[last] ^= 0x01;
    std::fs::write(&block, &damaged).expect("damage block");

    let mut consumer = reader(dir.path());
    let group = consumer.coupler_mut("G").expect("reader group");
    let err = group
        .begin_step_at(2, Some(Duration::ZERO))
        .expect_err("damaged block");
    assert!(matches!(err, coupler::Error::Corrupt(_)), "got {err:?}");
    assert!(!group.is_open(), "a failed scan drops its handle");
    assert_eq!(group.current_step(), -1);

    std::fs::write(&block, &pristine).expect("restore block");
    assert_eq!(
        group.begin_step_at(2, Some(Duration::ZERO)).expect("seek 2"),
        StepStatus::Ready
    );
    assert_eq!(group.get("v").expect("get"), Some(Value::I64(2)));
    group.end_step().expect("end");
    assert_eq!(group.current_step(), 2);
}
