
use smallrender::jobs::{JobState, JobStore};
use smallrender::storage;
use test_harness::{test_manifest, TestFarm, COORD_ID};

fn store(farm: &TestFarm) -> std::sync::Arc<JobStore> {
    JobStore::new(&farm.farm_path, farm.log.clone())
}

#[test]
fn submit_creates_manifest_and_initial_state() {
    let farm = TestFarm::new();
    let store = store(&farm);

    let manifest = test_manifest("my-shot", 1, 10, 5);
    let slug = store.submit_job(&manifest, 50).unwrap();
    assert_eq!(slug, "my-shot");

    store.scan_once();
    let jobs = store.job_snapshot();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].current_state, JobState::Active);
    assert_eq!(jobs[0].current_priority, 50);
    assert_eq!(jobs[0].manifest.frame_end, 10);

    let states = farm.state_files("my-shot");
    assert_eq!(states.len(), 1);
    assert!(states[0].ends_with(&format!("_{COORD_ID}.json")));
}

#[test]
fn duplicate_submission_fails() {
    let farm = TestFarm::new();
    let store = store(&farm);

    let manifest = test_manifest("my-shot", 1, 10, 5);
    store.submit_job(&manifest, 50).unwrap();
    assert!(store.submit_job(&manifest, 50).is_err());
}

#[test]
fn newest_state_entry_wins() {
    let farm = TestFarm::new();
    let store = store(&farm);

    store.submit_job(&test_manifest("my-shot", 1, 10, 5), 50).unwrap();
    store
        .write_state_entry("my-shot", JobState::Paused, 70, COORD_ID)
        .unwrap();

    store.scan_once();
    let jobs = store.job_snapshot();
    assert_eq!(jobs[0].current_state, JobState::Paused);
    assert_eq!(jobs[0].current_priority, 70);
}

#[test]
fn unparsable_newest_state_falls_back_to_older_entry() {
    let farm = TestFarm::new();
    let store = store(&farm);

    store.submit_job(&test_manifest("my-shot", 1, 10, 5), 50).unwrap();

    // A state entry mid-sync: newest by filename but unreadable.
    let state_dir = farm.farm_path.join("jobs").join("my-shot").join("state");
    std::fs::write(state_dir.join("99999999999999_zzzz.json"), "{trunc").unwrap();

    store.scan_once();
    assert_eq!(store.job_snapshot()[0].current_state, JobState::Active);
}

#[test]
fn jobs_without_manifest_are_skipped() {
    let farm = TestFarm::new();
    let store = store(&farm);

    std::fs::create_dir_all(farm.farm_path.join("jobs").join("half-synced")).unwrap();
    store.submit_job(&test_manifest("real", 1, 2, 1), 50).unwrap();

    store.scan_once();
    assert_eq!(store.job_snapshot().len(), 1);
}

#[test]
fn snapshot_orders_by_priority_then_submission_time() {
    let farm = TestFarm::new();
    let store = store(&farm);

    let mut low = test_manifest("low", 1, 2, 1);
    low.submitted_at_ms = 1000;
    let mut old_high = test_manifest("old-high", 1, 2, 1);
    old_high.submitted_at_ms = 2000;
    let mut new_high = test_manifest("new-high", 1, 2, 1);
    new_high.submitted_at_ms = 3000;

    store.submit_job(&low, 10).unwrap();
    store.submit_job(&new_high, 90).unwrap();
    store.submit_job(&old_high, 90).unwrap();

    store.scan_once();
    let order: Vec<String> = store
        .job_snapshot()
        .iter()
        .map(|j| j.manifest.job_id.clone())
        .collect();
    assert_eq!(order, vec!["old-high", "new-high", "low"]);
}

#[test]
fn delete_removes_the_job_tree() {
    let farm = TestFarm::new();
    let store = store(&farm);

    store.submit_job(&test_manifest("doomed", 1, 2, 1), 50).unwrap();
    store.delete_job("doomed").unwrap();

    assert!(!farm.farm_path.join("jobs").join("doomed").exists());
    store.scan_once();
    assert!(store.job_snapshot().is_empty());
}

#[test]
fn requeue_appends_counter_and_strips_old_suffix() {
    let farm = TestFarm::new();
    let store = store(&farm);

    store.submit_job(&test_manifest("shot", 1, 2, 1), 60).unwrap();
    store.scan_once();

    let first = store.requeue_job("shot", COORD_ID).unwrap();
    assert_eq!(first, "shot-requeue1");

    store.scan_once();
    let second = store.requeue_job("shot-requeue1", COORD_ID).unwrap();
    assert_eq!(second, "shot-requeue2");

    // The requeued copy keeps the source's priority.
    store.scan_once();
    let job = store
        .job_snapshot()
        .into_iter()
        .find(|j| j.manifest.job_id == "shot-requeue2")
        .unwrap();
    assert_eq!(job.current_priority, 60);
}

#[test]
fn scan_respects_cooldown_until_invalidated() {
    let farm = TestFarm::new();
    let store = store(&farm);
    store.scan_once();

    // A job submitted behind the store's back is not seen by a cooled-down
    // scan, but an invalidation forces it through.
    let manifest = test_manifest("sneaky", 1, 2, 1);
    let job_dir = farm.farm_path.join("jobs").join("sneaky");
    std::fs::create_dir_all(job_dir.join("state")).unwrap();
    storage::write_json(&job_dir.join("manifest.json"), &manifest).unwrap();

    store.scan();
    assert!(store.job_snapshot().is_empty());

    store.invalidate();
    store.scan();
    assert_eq!(store.job_snapshot().len(), 1);
}
