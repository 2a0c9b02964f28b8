//! Worker-side merge: lock discipline, supervision and outcome journaling.
//!
//! The merge collaborator is replaced by small `sh -c` scripts. The
//! instruction is appended as the final argument, so it arrives as `$1`.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use workmem_core::{Config, StateLayout};
use workmem_storage::{Journal, TaskOutcome};
use workmem_sync::{MergeRequest, run_merge_task};

fn project() -> (tempfile::TempDir, StateLayout) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let layout = StateLayout::new(tmp.path(), ".workmem");
    layout.ensure().expect("create state dir");
    (tmp, layout)
}

fn config_with_script(script: &str) -> Config {
    Config {
        merge_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "merge".to_string(),
        ],
        merge_timeout_secs: 30,
        lock_timeout_secs: 5,
        lock_retry_interval_ms: 50,
        ..Config::default()
    }
}

fn request(root: &Path, session: &str) -> MergeRequest {
    MergeRequest {
        project_root: root.to_path_buf(),
        session_id: session.to_string(),
        transcript_path: None,
    }
}

fn read(path: &PathBuf) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[test]
fn successful_merge_installs_staged_document() {
    let (tmp, layout) = project();
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Decisions\n\n- old\n").unwrap();
    let config = config_with_script(r#"printf '%s' "$1" > "$WORKMEM_TARGET""#);

    let entry = run_merge_task(&config, &request(tmp.path(), "s1")).unwrap();
    assert_eq!(entry.outcome, TaskOutcome::Success);

    // The installed document is exactly what the collaborator wrote: the
    // instruction, which embeds the pre-existing content re-read under the lock.
    let installed = read(&layout.memory_path());
    assert!(installed.contains("equally current"));
    assert!(installed.contains("- old"));
    assert!(!layout.staging_path().exists());
    assert!(!layout.lock_path().exists());

    let journal = Journal::new(layout.journal_path()).read_recent(10).unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].outcome, TaskOutcome::Success);
    assert_eq!(journal[0].session_id, "s1");
}

#[test]
fn merge_subprocess_is_marked_as_background() {
    let (tmp, layout) = project();
    let config = config_with_script(r#"printf '%s' "$WORKMEM_INVOCATION" > "$WORKMEM_TARGET""#);
    run_merge_task(&config, &request(tmp.path(), "s1")).unwrap();
    assert_eq!(read(&layout.memory_path()), "background-worker");
}

#[test]
fn failing_merge_leaves_document_untouched() {
    let (tmp, layout) = project();
    std::fs::write(layout.memory_path(), "last known good").unwrap();
    let config = config_with_script(r#"printf 'half a doc' > "$WORKMEM_TARGET"; exit 3"#);

    let entry = run_merge_task(&config, &request(tmp.path(), "s1")).unwrap();
    assert_eq!(entry.outcome, TaskOutcome::Failure);
    assert!(entry.detail.as_deref().unwrap().contains("exit"));
    assert_eq!(read(&layout.memory_path()), "last known good");
    assert!(!layout.staging_path().exists());
}

#[test]
fn empty_output_is_a_failure() {
    let (tmp, layout) = project();
    std::fs::write(layout.memory_path(), "last known good").unwrap();
    let config = config_with_script("true");

    let entry = run_merge_task(&config, &request(tmp.path(), "s1")).unwrap();
    assert_eq!(entry.outcome, TaskOutcome::Failure);
    assert_eq!(read(&layout.memory_path()), "last known good");
}

#[test]
fn overrunning_merge_is_a_timeout_not_a_failure() {
    let (tmp, layout) = project();
    std::fs::write(layout.memory_path(), "last known good").unwrap();
    let mut config = config_with_script(r#"printf 'partial' > "$WORKMEM_TARGET"; sleep 30"#);
    config.merge_timeout_secs = 1;

    let start = Instant::now();
    let entry = run_merge_task(&config, &request(tmp.path(), "s1")).unwrap();
    assert_eq!(entry.outcome, TaskOutcome::Timeout);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(read(&layout.memory_path()), "last known good");
    assert!(!layout.staging_path().exists());
    assert!(!layout.lock_path().exists());

    let journal = Journal::new(layout.journal_path()).read_recent(10).unwrap();
    assert_eq!(journal[0].outcome, TaskOutcome::Timeout);
}

#[test]
fn concurrent_idle_b_skips_while_a_merges() {
    let (tmp, layout) = project();
    let root = tmp.path().to_path_buf();

    let a_config = config_with_script(r#"sleep 3; printf 'merged by A' > "$WORKMEM_TARGET""#);
    let a_root = root.clone();
    let a = std::thread::spawn(move || run_merge_task(&a_config, &request(&a_root, "A")).unwrap());

    // Wait for A to hold the lock.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !layout.lock_path().exists() {
        assert!(Instant::now() < deadline, "A never took the lock");
        std::thread::sleep(Duration::from_millis(10));
    }

    let mut b_config = config_with_script(r#"printf 'merged by B' > "$WORKMEM_TARGET""#);
    b_config.lock_timeout_secs = 1;
    let b = run_merge_task(&b_config, &request(&root, "B")).unwrap();
    assert_eq!(b.outcome, TaskOutcome::Skipped);
    assert!(b.detail.as_deref().unwrap().contains("lock timeout"));

    let a = a.join().unwrap();
    assert_eq!(a.outcome, TaskOutcome::Success);
    assert_eq!(read(&layout.memory_path()), "merged by A");

    let journal = Journal::new(layout.journal_path()).read_recent(10).unwrap();
    let outcomes: Vec<(&str, TaskOutcome)> = journal
        .iter()
        .map(|e| (e.session_id.as_str(), e.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![("B", TaskOutcome::Skipped), ("A", TaskOutcome::Success)]
    );
}

#[test]
fn live_merge_outlasting_stale_threshold_keeps_its_lock() {
    let (tmp, layout) = project();
    let root = tmp.path().to_path_buf();
    let inside = root.join("inside");
    let overlap = root.join("overlap");
    let script = format!(
        r#"if [ -e '{inside}' ]; then touch '{overlap}'; fi; touch '{inside}'; sleep 3; rm -f '{inside}'; printf 'merged' > "$WORKMEM_TARGET""#,
        inside = inside.display(),
        overlap = overlap.display(),
    );
    // Far below the merge deadline; the lock must still not be taken from a
    // live holder.
    let config = Config {
        stale_lock_secs: 1,
        merge_timeout_secs: 10,
        ..config_with_script(&script)
    };

    let a_config = config.clone();
    let a_root = root.clone();
    let a = std::thread::spawn(move || run_merge_task(&a_config, &request(&a_root, "A")).unwrap());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !inside.exists() {
        assert!(Instant::now() < deadline, "A never started merging");
        std::thread::sleep(Duration::from_millis(10));
    }

    let b_config = Config {
        lock_timeout_secs: 2,
        ..config
    };
    let b = run_merge_task(&b_config, &request(&root, "B")).unwrap();
    assert_eq!(b.outcome, TaskOutcome::Skipped);

    let a = a.join().unwrap();
    assert_eq!(a.outcome, TaskOutcome::Success);
    assert!(!overlap.exists(), "two merges ran under one lock");
    assert!(!layout.lock_path().exists());
}

#[test]
fn orphaned_lock_from_crashed_worker_is_recovered() {
    let (tmp, layout) = project();
    std::fs::write(layout.lock_path(), "").unwrap();
    let f = std::fs::OpenOptions::new()
        .write(true)
        .open(layout.lock_path())
        .unwrap();
    f.set_modified(SystemTime::now() - Duration::from_secs(600))
        .unwrap();
    drop(f);

    let config = config_with_script(r#"printf 'recovered' > "$WORKMEM_TARGET""#);
    let entry = run_merge_task(&config, &request(tmp.path(), "s1")).unwrap();
    assert_eq!(entry.outcome, TaskOutcome::Success);
    assert_eq!(read(&layout.memory_path()), "recovered");
}

#[test]
fn uninitialized_project_is_configuration_absent() {
    let tmp = tempfile::tempdir().unwrap();
    let err = run_merge_task(&Config::default(), &request(tmp.path(), "s1")).unwrap_err();
    assert_eq!(err.error_type(), "CONFIGURATION_ABSENT");
    assert!(!tmp.path().join(".workmem").exists());
}
