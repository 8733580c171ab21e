
use std::sync::Arc;

use smallrender::command::{Action, CommandChannel, CommandKind};
use smallrender::config::TimingPreset;
use smallrender::dispatch::DispatchEngine;
use smallrender::jobs::{compute_chunks, ChunkRange, ChunkState, DispatchTable, JobState};
use smallrender::storage;
use test_harness::*;

fn make_engine(farm: &TestFarm) -> (DispatchEngine, Arc<CommandChannel>) {
    let commands = CommandChannel::new(&farm.farm_path, COORD_ID, farm.log.clone(), None);
    let engine = DispatchEngine::new(
        &farm.farm_path,
        COORD_ID,
        TimingPreset::LocalNas.timing(),
        farm.log.clone(),
        Arc::clone(&commands),
    );
    (engine, commands)
}

#[test]
fn chunk_computation_boundaries() {
    // Even split.
    let chunks = compute_chunks(1, 10, 5);
    assert_eq!(chunks, vec![ChunkRange::new(1, 5), ChunkRange::new(6, 10)]);

    // Ragged tail.
    let chunks = compute_chunks(1, 7, 3);
    assert_eq!(
        chunks,
        vec![ChunkRange::new(1, 3), ChunkRange::new(4, 6), ChunkRange::new(7, 7)]
    );

    // Chunk larger than the range: one chunk.
    assert_eq!(compute_chunks(1, 4, 100), vec![ChunkRange::new(1, 4)]);

    // Single frame.
    assert_eq!(compute_chunks(5, 5, 1), vec![ChunkRange::new(5, 5)]);

    // Degenerate inputs.
    assert!(compute_chunks(10, 1, 5).is_empty());
    assert!(compute_chunks(1, 10, 0).is_empty());
}

#[test]
fn chunks_partition_the_frame_range_in_order() {
    let chunks = compute_chunks(17, 131, 7);
    assert_eq!(chunks.first().unwrap().frame_start, 17);
    assert_eq!(chunks.last().unwrap().frame_end, 131);
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].frame_end + 1, pair[1].frame_start);
        assert!(pair[0].frame_start <= pair[0].frame_end);
    }
}

#[test]
fn remote_assignment_sends_command_and_tracks_it() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 10, 5), 50)];
    let nodes = vec![idle_node(WORKER_ID, false)];

    let local = engine.tick(&nodes, &jobs);
    assert!(local.is_empty(), "remote worker must not produce local dispatch");

    let table = engine.table("shot").unwrap();
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert_eq!(table.chunks[0].assigned_to, WORKER_ID);
    assert!(table.chunks[0].assigned_at_ms > 0);
    assert_eq!(table.chunks[1].state, ChunkState::Pending);

    let (job_id, chunk) = engine.assignment_for(WORKER_ID).unwrap();
    assert_eq!(job_id, "shot");
    assert_eq!(chunk, ChunkRange::new(1, 5));

    // The worker received exactly one assign_chunk.
    let inbox = farm.inbox_files(WORKER_ID);
    assert_eq!(inbox.len(), 1);
    let cmd: serde_json::Value = storage::read_json(
        &farm.farm_path.join("commands").join(WORKER_ID).join(&inbox[0]),
    )
    .unwrap();
    assert_eq!(cmd["type"], "assign_chunk");
    assert_eq!(cmd["frame_start"], 1);
    assert_eq!(cmd["frame_end"], 5);
}

#[test]
fn one_assignment_per_worker_per_cycle() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 100, 5), 50)];
    let nodes = vec![idle_node(WORKER_ID, false), idle_node("bbbbbbbbbbbb", false)];

    engine.tick(&nodes, &jobs);
    assert_eq!(engine.assignment_count(), 2);

    let table = engine.table("shot").unwrap();
    let assigned = table
        .chunks
        .iter()
        .filter(|c| c.state == ChunkState::Assigned)
        .count();
    assert_eq!(assigned, 2);
}

#[test]
fn local_node_gets_local_dispatch_not_a_command() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 10, 5), 50)];
    let nodes = vec![idle_node(COORD_ID, true)];

    let local = engine.tick(&nodes, &jobs);
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].manifest.job_id, "shot");
    assert_eq!(local[0].chunk, ChunkRange::new(1, 5));
    assert!(farm.inbox_files(COORD_ID).is_empty());
}

#[test]
fn priority_order_decides_which_job_runs_first() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![
        active_job(test_manifest("low", 1, 10, 5), 10),
        active_job(test_manifest("high", 1, 10, 5), 90),
    ];
    let nodes = vec![idle_node(WORKER_ID, false)];

    engine.tick(&nodes, &jobs);
    let (job_id, _) = engine.assignment_for(WORKER_ID).unwrap();
    assert_eq!(job_id, "high");
}

#[test]
fn tag_and_os_requirements_gate_the_pairing() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let mut manifest = test_manifest("gpu-job", 1, 10, 5);
    manifest.tags_required = vec!["gpu".to_string()];
    let jobs = vec![active_job(manifest, 50)];

    // Worker without the tag: skipped.
    let nodes = vec![idle_node(WORKER_ID, false)];
    engine.tick(&nodes, &jobs);
    assert_eq!(engine.assignment_count(), 0);

    // Worker with the tag: assigned.
    let mut tagged = idle_node(WORKER_ID, false);
    tagged.heartbeat.tags = vec!["gpu".to_string()];
    engine.tick(&[tagged], &jobs);
    assert_eq!(engine.assignment_count(), 1);

    // Worker on an OS the manifest has no command for: skipped.
    let (mut engine2, _c2) = make_engine(&farm);
    let mut other_os = idle_node("bbbbbbbbbbbb", false);
    other_os.heartbeat.os = "plan9".to_string();
    engine2.tick(&[other_os], &jobs);
    assert_eq!(engine2.assignment_count(), 0);
}

#[test]
fn completion_transitions_and_writes_state_entry_once() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 10, 5), 50)];
    let nodes = vec![idle_node(WORKER_ID, false)];

    engine.tick(&nodes, &jobs);
    engine.queue_worker_report(report(WORKER_ID, "shot", CommandKind::ChunkCompleted, 1, 5));
    engine.tick(&nodes, &jobs);
    engine.queue_worker_report(report(WORKER_ID, "shot", CommandKind::ChunkCompleted, 6, 10));
    engine.tick(&nodes, &jobs);

    let table = engine.table("shot").unwrap();
    assert!(table.chunks.iter().all(|c| c.state == ChunkState::Completed));
    assert!(table.chunks.iter().all(|c| c.completed_at_ms > 0));

    let completed_entries = farm
        .state_files("shot")
        .into_iter()
        .filter(|n| {
            let path = farm.farm_path.join("jobs").join("shot").join("state").join(n);
            storage::read_json::<smallrender::jobs::JobStateEntry>(&path)
                .is_some_and(|e| e.state == JobState::Completed)
        })
        .count();
    assert_eq!(completed_entries, 1);

    // Re-running the cycle on a full table is idempotent.
    engine.tick(&nodes, &jobs);
    engine.tick(&nodes, &jobs);
    let completed_entries = farm
        .state_files("shot")
        .into_iter()
        .filter(|n| n.contains(&format!("_{COORD_ID}")))
        .count();
    assert_eq!(completed_entries, 1);
}

fn report(from: &str, job_id: &str, kind: CommandKind, fs: i32, fe: i32) -> Action {
    Action {
        kind,
        job_id: job_id.to_string(),
        reason: String::new(),
        frame_start: fs,
        frame_end: fe,
        from_node_id: from.to_string(),
        msg_id: format!("{}.{from}", smallrender::now_ms()),
    }
}

#[test]
fn retry_exhaustion_marks_chunk_failed_and_blocks_completion() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let mut manifest = test_manifest("flaky", 1, 5, 5);
    manifest.max_retries = 2;
    let jobs = vec![active_job(manifest, 50)];
    let nodes = vec![idle_node(WORKER_ID, false)];

    for attempt in 0..2 {
        engine.tick(&nodes, &jobs);
        assert_eq!(
            engine.table("flaky").unwrap().chunks[0].state,
            ChunkState::Assigned,
            "attempt {attempt}"
        );
        engine.queue_worker_report(report(WORKER_ID, "flaky", CommandKind::ChunkFailed, 1, 5));
        engine.tick(&nodes, &jobs);
    }

    let chunk = &engine.table("flaky").unwrap().chunks[0];
    assert_eq!(chunk.state, ChunkState::Failed);
    assert_eq!(chunk.retry_count, 2);

    // No completion entry may ever appear.
    engine.tick(&nodes, &jobs);
    let has_completed = farm.state_files("flaky").iter().any(|n| {
        let path = farm.farm_path.join("jobs").join("flaky").join("state").join(n);
        storage::read_json::<smallrender::jobs::JobStateEntry>(&path)
            .is_some_and(|e| e.state == JobState::Completed)
    });
    assert!(!has_completed);
}

#[test]
fn failed_chunk_under_retry_limit_returns_to_pending() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 5, 5), 50)];
    let nodes = vec![idle_node(WORKER_ID, false)];

    engine.tick(&nodes, &jobs);
    engine.queue_worker_report(report(WORKER_ID, "shot", CommandKind::ChunkFailed, 1, 5));
    // Process the report with no idle worker around, so the chunk's state
    // is observable before any reassignment.
    engine.tick(&[], &jobs);

    let chunk = &engine.table("shot").unwrap().chunks[0];
    // max_retries is 3; one failure leaves it pending for another worker.
    assert_eq!(chunk.state, ChunkState::Pending);
    assert_eq!(chunk.retry_count, 1);
    assert!(chunk.assigned_to.is_empty());
    assert_eq!(chunk.assigned_at_ms, 0);
}

#[test]
fn dead_worker_assignment_is_reclaimed_immediately() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 10, 5), 50)];
    engine.tick(&[idle_node(WORKER_ID, false)], &jobs);
    assert_eq!(engine.assignment_count(), 1);

    // Next cycle the worker is dead and reclaim-eligible.
    engine.tick(&[dead_node(WORKER_ID)], &jobs);
    assert_eq!(engine.assignment_count(), 0);

    let chunk = &engine.table("shot").unwrap().chunks[0];
    assert_eq!(chunk.state, ChunkState::Pending);
    assert_eq!(chunk.retry_count, 1, "a reclaim costs a retry");
}

#[test]
fn stale_assignment_is_reclaimed_when_worker_is_not_rendering_it() {
    let farm = TestFarm::new();

    // Seed a dispatch table on disk with an hour-old assignment, as if a
    // previous coordinator process had made it.
    let manifest = test_manifest("shot", 1, 10, 5);
    let job_dir = farm.farm_path.join("jobs").join("shot");
    std::fs::create_dir_all(job_dir.join("state")).unwrap();
    let mut table = DispatchTable::for_manifest(COORD_ID, &manifest, smallrender::now_ms());
    table.chunks[0].state = ChunkState::Assigned;
    table.chunks[0].assigned_to = WORKER_ID.to_string();
    table.chunks[0].assigned_at_ms = smallrender::now_ms() - 60 * 60 * 1000;
    storage::write_json(&job_dir.join("dispatch.json"), &table).unwrap();

    let (mut engine, _commands) = make_engine(&farm);
    let jobs = vec![active_job(manifest, 50)];

    // Worker is alive but idle (not rendering this job): stale.
    let mut nodes = vec![idle_node(WORKER_ID, false)];
    nodes[0].heartbeat.render_state = smallrender::heartbeat::RenderState::Rendering;
    nodes[0].heartbeat.active_job = Some("some-other-job".to_string());

    engine.tick(&nodes, &jobs);

    let chunk = &engine.table("shot").unwrap().chunks[0];
    assert!(chunk.state == ChunkState::Pending || chunk.assigned_to != WORKER_ID);
    assert_eq!(chunk.retry_count, 1);
}

#[test]
fn stale_window_spares_a_worker_still_rendering_the_job() {
    let farm = TestFarm::new();

    let manifest = test_manifest("shot", 1, 10, 5);
    let job_dir = farm.farm_path.join("jobs").join("shot");
    std::fs::create_dir_all(job_dir.join("state")).unwrap();
    let mut table = DispatchTable::for_manifest(COORD_ID, &manifest, smallrender::now_ms());
    table.chunks[0].state = ChunkState::Assigned;
    table.chunks[0].assigned_to = WORKER_ID.to_string();
    table.chunks[0].assigned_at_ms = smallrender::now_ms() - 60 * 60 * 1000;
    storage::write_json(&job_dir.join("dispatch.json"), &table).unwrap();

    let (mut engine, _commands) = make_engine(&farm);
    let jobs = vec![active_job(manifest, 50)];
    let nodes = vec![rendering_node(WORKER_ID, "shot")];

    engine.tick(&nodes, &jobs);

    let chunk = &engine.table("shot").unwrap().chunks[0];
    assert_eq!(chunk.state, ChunkState::Assigned);
    assert_eq!(chunk.assigned_to, WORKER_ID);
    assert_eq!(chunk.retry_count, 0);
}

#[test]
fn pause_reverts_assigned_chunks_and_aborts_the_holder() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 10, 5), 50)];
    engine.tick(&[idle_node(WORKER_ID, false)], &jobs);
    assert_eq!(farm.inbox_files(WORKER_ID).len(), 1); // assign_chunk

    engine.handle_job_state_change("shot", JobState::Paused, &jobs);

    assert_eq!(engine.assignment_count(), 0);
    let table = engine.table("shot").unwrap();
    assert!(table.chunks.iter().all(|c| c.state == ChunkState::Pending));

    let inbox = farm.inbox_files(WORKER_ID);
    assert_eq!(inbox.len(), 2);
    let abort: serde_json::Value = storage::read_json(
        &farm.farm_path.join("commands").join(WORKER_ID).join(&inbox[1]),
    )
    .unwrap();
    assert_eq!(abort["type"], "abort_chunk");
    assert_eq!(abort["job_id"], "shot");
}

#[test]
fn manual_retry_keeps_the_retry_count() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let mut manifest = test_manifest("flaky", 1, 5, 5);
    manifest.max_retries = 2;
    let jobs = vec![active_job(manifest, 50)];
    let nodes = vec![idle_node(WORKER_ID, false)];

    for _ in 0..2 {
        engine.tick(&nodes, &jobs);
        engine.queue_worker_report(report(WORKER_ID, "flaky", CommandKind::ChunkFailed, 1, 5));
        engine.tick(&nodes, &jobs);
    }
    assert_eq!(engine.table("flaky").unwrap().chunks[0].state, ChunkState::Failed);

    engine.retry_failed_chunk("flaky", 1, 5);
    let chunk = &engine.table("flaky").unwrap().chunks[0];
    assert_eq!(chunk.state, ChunkState::Pending);
    assert_eq!(chunk.retry_count, 2, "manual retry must not reset the counter");

    // The very next failure trips the ceiling again.
    engine.tick(&nodes, &jobs);
    engine.queue_worker_report(report(WORKER_ID, "flaky", CommandKind::ChunkFailed, 1, 5));
    engine.tick(&nodes, &jobs);
    assert_eq!(engine.table("flaky").unwrap().chunks[0].state, ChunkState::Failed);
}

#[test]
fn recovery_resets_dead_assignments_and_keeps_live_ones() {
    let farm = TestFarm::new();

    let manifest = test_manifest("shot", 1, 15, 5);
    let job_dir = farm.farm_path.join("jobs").join("shot");
    std::fs::create_dir_all(job_dir.join("state")).unwrap();
    let mut table = DispatchTable::for_manifest(COORD_ID, &manifest, smallrender::now_ms());
    table.chunks[0].state = ChunkState::Assigned;
    table.chunks[0].assigned_to = "deaddeaddead".to_string();
    table.chunks[0].assigned_at_ms = smallrender::now_ms();
    table.chunks[1].state = ChunkState::Assigned;
    table.chunks[1].assigned_to = WORKER_ID.to_string();
    table.chunks[1].assigned_at_ms = smallrender::now_ms();
    table.chunks[2].state = ChunkState::Completed;
    table.chunks[2].completed_at_ms = smallrender::now_ms();
    storage::write_json(&job_dir.join("dispatch.json"), &table).unwrap();

    let (mut engine, _commands) = make_engine(&farm);
    let jobs = vec![active_job(manifest, 50)];
    let nodes = vec![dead_node("deaddeaddead"), rendering_node(WORKER_ID, "shot")];

    engine.tick(&nodes, &jobs);

    let table = engine.table("shot").unwrap();
    // Dead node's chunk freed (and possibly not reassigned: no idle worker).
    assert_eq!(table.chunks[0].state, ChunkState::Pending);
    // Live worker's chunk kept, assignment tracked again.
    assert_eq!(table.chunks[1].state, ChunkState::Assigned);
    assert_eq!(engine.assignment_for(WORKER_ID).unwrap().0, "shot");
    // Completed chunk untouched.
    assert_eq!(table.chunks[2].state, ChunkState::Completed);
}

#[test]
fn dirty_tables_flush_on_stop() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let jobs = vec![active_job(test_manifest("shot", 1, 10, 5), 50)];
    engine.tick(&[idle_node(WORKER_ID, false)], &jobs);
    engine.stop();

    let table: DispatchTable =
        storage::read_json(&farm.farm_path.join("jobs").join("shot").join("dispatch.json"))
            .expect("dispatch.json written");
    assert_eq!(table.coordinator_id, COORD_ID);
    assert_eq!(table.chunks.len(), 2);
    assert_eq!(table.chunks[0].state, ChunkState::Assigned);
    assert!(table.updated_at_ms > 0);
}

#[test]
fn empty_frame_range_completes_without_chunks() {
    let farm = TestFarm::new();
    let (mut engine, _commands) = make_engine(&farm);

    let mut manifest = test_manifest("empty", 1, 10, 5);
    manifest.chunk_size = 0; // degenerate: no chunks can be computed
    let jobs = vec![active_job(manifest, 50)];

    engine.tick(&[idle_node(WORKER_ID, false)], &jobs);
    engine.tick(&[idle_node(WORKER_ID, false)], &jobs);

    let has_completed = farm.state_files("empty").iter().any(|n| {
        let path = farm.farm_path.join("jobs").join("empty").join("state").join(n);
        storage::read_json::<smallrender::jobs::JobStateEntry>(&path)
            .is_some_and(|e| e.state == JobState::Completed)
    });
    assert!(has_completed, "a job with no work is trivially complete");
}
