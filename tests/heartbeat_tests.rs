
use smallrender::config::TimingPreset;
use smallrender::heartbeat::{Heartbeat, HeartbeatEngine, NodeState};
use smallrender::identity::NodeIdentity;
use smallrender::storage;
use test_harness::{test_heartbeat, TestFarm, WORKER_ID};

fn engine(farm: &TestFarm, coordinator: bool) -> std::sync::Arc<HeartbeatEngine> {
    HeartbeatEngine::new(
        &farm.farm_path,
        &NodeIdentity::with_id(test_harness::COORD_ID),
        TimingPreset::LocalNas.timing(),
        vec![],
        coordinator,
        farm.log.clone(),
        None,
    )
}

fn read_own_heartbeat(farm: &TestFarm) -> Heartbeat {
    storage::read_json(
        &farm
            .farm_path
            .join("nodes")
            .join(test_harness::COORD_ID)
            .join("heartbeat.json"),
    )
    .expect("own heartbeat")
}

#[test]
fn seq_advances_strictly_on_every_beat() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);

    engine.beat_once();
    let first = read_own_heartbeat(&farm);
    engine.beat_once();
    let second = read_own_heartbeat(&farm);

    assert_eq!(first.seq, 1);
    assert_eq!(second.seq, 2);
    assert_eq!(first.node_state, NodeState::Active);
}

#[test]
fn final_heartbeat_reports_stopped() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);

    engine.beat_once();
    engine.write_final_heartbeat();

    let hb = read_own_heartbeat(&farm);
    assert_eq!(hb.node_state, NodeState::Stopped);
    assert_eq!(hb.seq, 2);
}

#[test]
fn peer_with_old_file_stays_dead_until_seq_advances() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);
    engine.beat_once();

    // An old but well-formed heartbeat left over from a previous run.
    farm.write_peer_heartbeat(&test_heartbeat(WORKER_ID, 57));
    engine.scan_once();

    let peer = engine
        .node_snapshot()
        .into_iter()
        .find(|n| n.heartbeat.node_id == WORKER_ID)
        .unwrap();
    assert!(peer.is_dead, "unproven peer must not count as alive");

    // The peer beats: seq advances, now it is alive.
    farm.write_peer_heartbeat(&test_heartbeat(WORKER_ID, 58));
    engine.scan_once();

    let peer = engine
        .node_snapshot()
        .into_iter()
        .find(|n| n.heartbeat.node_id == WORKER_ID)
        .unwrap();
    assert!(!peer.is_dead);
    assert!(!peer.reclaim_eligible);
}

#[test]
fn stale_peer_dies_after_threshold_scans_with_grace() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);
    engine.beat_once();

    farm.write_peer_heartbeat(&test_heartbeat(WORKER_ID, 1));
    engine.scan_once();
    farm.write_peer_heartbeat(&test_heartbeat(WORKER_ID, 2));
    engine.scan_once(); // advance -> alive

    let dead_scans = TimingPreset::LocalNas.timing().dead_threshold_scans;
    for i in 0..dead_scans {
        engine.scan_once(); // seq stays at 2
        let peer = engine
            .node_snapshot()
            .into_iter()
            .find(|n| n.heartbeat.node_id == WORKER_ID)
            .unwrap();
        if i + 1 < dead_scans {
            assert!(!peer.is_dead, "dead too early at scan {}", i + 1);
        } else {
            assert!(peer.is_dead);
            assert!(!peer.reclaim_eligible, "first dead scan is a grace period");
        }
    }

    // One more stale scan makes the chunks reclaimable.
    engine.scan_once();
    let peer = engine
        .node_snapshot()
        .into_iter()
        .find(|n| n.heartbeat.node_id == WORKER_ID)
        .unwrap();
    assert!(peer.is_dead);
    assert!(peer.reclaim_eligible);
}

#[test]
fn reviving_peer_clears_death() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);
    engine.beat_once();

    farm.write_peer_heartbeat(&test_heartbeat(WORKER_ID, 1));
    engine.scan_once();
    for _ in 0..5 {
        engine.scan_once();
    }
    assert!(engine
        .node_snapshot()
        .iter()
        .find(|n| n.heartbeat.node_id == WORKER_ID)
        .unwrap()
        .is_dead);

    farm.write_peer_heartbeat(&test_heartbeat(WORKER_ID, 2));
    engine.scan_once();

    let peer = engine
        .node_snapshot()
        .into_iter()
        .find(|n| n.heartbeat.node_id == WORKER_ID)
        .unwrap();
    assert!(!peer.is_dead);
    assert_eq!(peer.stale_count, 0);
}

#[test]
fn stopped_peer_is_immediately_dead_and_reclaimable() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);
    engine.beat_once();

    let mut hb = test_heartbeat(WORKER_ID, 10);
    hb.node_state = NodeState::Stopped;
    farm.write_peer_heartbeat(&hb);
    engine.scan_once();

    let peer = engine
        .node_snapshot()
        .into_iter()
        .find(|n| n.heartbeat.node_id == WORKER_ID)
        .unwrap();
    assert!(peer.is_dead);
    assert!(peer.reclaim_eligible);
}

#[test]
fn clock_skew_flags_peer_and_majority_flags_self() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);
    engine.beat_once();

    // Two peers ten minutes ahead, one in sync. All must be alive first.
    let peers = ["b1b1b1b1b1b1", "b2b2b2b2b2b2", "b3b3b3b3b3b3"];
    for id in &peers {
        farm.write_peer_heartbeat(&test_heartbeat(id, 1));
    }
    engine.scan_once();
    for id in &peers {
        farm.write_peer_heartbeat(&test_heartbeat(id, 2));
    }
    engine.scan_once();

    // Skew two of three.
    for id in &peers[..2] {
        let mut hb = test_heartbeat(id, 3);
        hb.timestamp_ms += 10 * 60 * 1000;
        farm.write_peer_heartbeat(&hb);
    }
    farm.write_peer_heartbeat(&test_heartbeat(&peers[2], 3));
    engine.scan_once();

    let snapshot = engine.node_snapshot();
    let skewed: Vec<bool> = peers
        .iter()
        .map(|id| {
            snapshot
                .iter()
                .find(|n| n.heartbeat.node_id == *id)
                .unwrap()
                .clock_skew_warning
        })
        .collect();
    assert_eq!(skewed, vec![true, true, false]);
    assert!(engine.has_local_clock_skew(), "2 of 3 skewed peers means we are the outlier");
}

#[test]
fn minority_skew_does_not_flag_self() {
    let farm = TestFarm::new();
    let engine = engine(&farm, false);
    engine.beat_once();

    let peers = ["b1b1b1b1b1b1", "b2b2b2b2b2b2", "b3b3b3b3b3b3"];
    for id in &peers {
        farm.write_peer_heartbeat(&test_heartbeat(id, 1));
    }
    engine.scan_once();
    for id in &peers {
        farm.write_peer_heartbeat(&test_heartbeat(id, 2));
    }
    engine.scan_once();

    let mut hb = test_heartbeat(&peers[0], 3);
    hb.timestamp_ms += 10 * 60 * 1000;
    farm.write_peer_heartbeat(&hb);
    farm.write_peer_heartbeat(&test_heartbeat(&peers[1], 3));
    farm.write_peer_heartbeat(&test_heartbeat(&peers[2], 3));
    engine.scan_once();

    assert!(!engine.has_local_clock_skew());
}

#[test]
fn render_state_setters_appear_on_next_beat() {
    let farm = TestFarm::new();
    let engine = engine(&farm, true);

    engine.set_render_state(
        smallrender::heartbeat::RenderState::Rendering,
        "my-shot",
        "f1-5",
    );
    engine.set_tags(vec!["gpu".to_string()]);
    engine.beat_once();

    let hb = read_own_heartbeat(&farm);
    assert_eq!(hb.render_state, smallrender::heartbeat::RenderState::Rendering);
    assert_eq!(hb.active_job.as_deref(), Some("my-shot"));
    assert_eq!(hb.active_frames.as_deref(), Some("f1-5"));
    assert_eq!(hb.tags, vec!["gpu".to_string()]);
    assert!(hb.is_coordinator);
}
