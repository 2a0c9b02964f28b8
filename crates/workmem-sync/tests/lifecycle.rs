//! Trigger-level behaviour of the memory synchronizer.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use git2::{Repository, Signature};
use workmem_core::{Config, MemoryDocument, StateLayout, SyncMode};
use workmem_storage::{Snapshot, SnapshotStore};
use workmem_sync::{
    HookPayload, HookResponse, IdleOutcome, InvocationSource, MemorySynchronizer, MergeRequest,
    TaskLauncher, Trigger,
};

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<MergeRequest>>,
}

impl RecordingLauncher {
    fn count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

impl TaskLauncher for RecordingLauncher {
    fn launch(&self, request: &MergeRequest) -> workmem_core::Result<()> {
        self.launched.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn config() -> Config {
    Config {
        // Any command that resolves on PATH.
        merge_command: vec!["sh".to_string()],
        ..Config::default()
    }
}

fn initialized_project() -> (tempfile::TempDir, StateLayout) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let layout = StateLayout::new(tmp.path(), ".workmem");
    layout.ensure().expect("create state dir");
    (tmp, layout)
}

fn payload(root: &Path) -> HookPayload {
    HookPayload {
        cwd: root.to_path_buf(),
        session_id: "sess-a".to_string(),
        ..HookPayload::default()
    }
}

fn age_file(path: &Path, age: Duration) {
    let f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(SystemTime::now() - age).unwrap();
}

fn commit(repo: &Repository, name: &str, message: &str) {
    let workdir = repo.workdir().unwrap();
    std::fs::write(workdir.join(name), message).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap();
}

fn context_text(resp: &HookResponse) -> &str {
    match resp {
        HookResponse::Context { text, .. } => text,
        other => panic!("expected context, got {other:?}"),
    }
}

// ────────────────────────────────────────────────────────────────────
// Idle
// ────────────────────────────────────────────────────────────────────

#[test]
fn second_idle_after_fresh_update_is_throttled() {
    let (tmp, layout) = initialized_project();
    std::fs::write(layout.memory_path(), "# Working Memory\n").unwrap();
    age_file(&layout.memory_path(), Duration::from_secs(600));

    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let p = payload(tmp.path());

    assert_eq!(
        sync.idle(&p, InvocationSource::Interactive).unwrap(),
        IdleOutcome::Launched
    );
    // A sibling's merge lands in between.
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Decisions\n\n- x\n").unwrap();
    assert_eq!(
        sync.idle(&p, InvocationSource::Interactive).unwrap(),
        IdleOutcome::Throttled
    );
    assert_eq!(sync.launcher().count(), 1);
}

#[test]
fn idle_launches_when_no_document_exists() {
    let (tmp, _layout) = initialized_project();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let mut p = payload(tmp.path());
    p.transcript_path = Some(tmp.path().join("t.jsonl"));

    assert_eq!(
        sync.idle(&p, InvocationSource::Interactive).unwrap(),
        IdleOutcome::Launched
    );
    let launched = sync.launcher().launched.lock().unwrap();
    assert_eq!(launched[0].session_id, "sess-a");
    assert_eq!(launched[0].project_root, tmp.path());
    assert_eq!(launched[0].transcript_path, p.transcript_path);
}

#[test]
fn idle_never_schedules_from_background_worker() {
    let (tmp, _layout) = initialized_project();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let p = payload(tmp.path());

    assert_eq!(
        sync.idle(&p, InvocationSource::BackgroundWorker).unwrap(),
        IdleOutcome::BackgroundInvocation
    );
    assert_eq!(
        sync.handle(Trigger::Idle, &p, InvocationSource::BackgroundWorker),
        HookResponse::Nothing
    );
    assert_eq!(sync.launcher().count(), 0);
}

#[test]
fn idle_respects_stop_hook_reentry() {
    let (tmp, _layout) = initialized_project();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let mut p = payload(tmp.path());
    p.stop_hook_active = true;
    assert_eq!(
        sync.idle(&p, InvocationSource::Interactive).unwrap(),
        IdleOutcome::StopHookActive
    );
    assert_eq!(sync.launcher().count(), 0);
}

#[test]
fn idle_without_merge_tool_is_a_noop() {
    let (tmp, _layout) = initialized_project();
    let cfg = Config {
        merge_command: vec!["workmem-no-such-merge-tool".to_string()],
        ..Config::default()
    };
    let sync = MemorySynchronizer::new(cfg, RecordingLauncher::default());
    assert_eq!(
        sync.idle(&payload(tmp.path()), InvocationSource::Interactive)
            .unwrap(),
        IdleOutcome::MissingTooling
    );
    assert_eq!(sync.launcher().count(), 0);
}

#[test]
fn blocking_mode_replies_with_block_envelope() {
    let (tmp, layout) = initialized_project();
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Current Focus\n\nlocks\n")
        .unwrap();
    age_file(&layout.memory_path(), Duration::from_secs(600));
    let cfg = Config {
        sync_mode: SyncMode::Blocking,
        ..config()
    };
    let sync = MemorySynchronizer::new(cfg, RecordingLauncher::default());

    let resp = sync.handle(Trigger::Idle, &payload(tmp.path()), InvocationSource::Interactive);
    let HookResponse::Block { reason } = &resp else {
        panic!("expected block, got {resp:?}");
    };
    assert!(reason.contains("equally current"));
    assert!(reason.contains(&layout.memory_path().display().to_string()));
    assert!(reason.contains("locks"));
    assert_eq!(sync.launcher().count(), 0);
}

#[test]
fn uninitialized_project_noops_every_trigger() {
    let tmp = tempfile::tempdir().unwrap();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let mut p = payload(tmp.path());
    p.prompt = Some("let's go with flock".into());

    for trigger in [
        Trigger::Init,
        Trigger::PromptObserved,
        Trigger::Idle,
        Trigger::PreCompact,
    ] {
        assert_eq!(
            sync.handle(trigger, &p, InvocationSource::Interactive),
            HookResponse::Nothing,
            "{trigger} should no-op"
        );
    }
    assert_eq!(sync.launcher().count(), 0);
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn disabled_config_noops_every_trigger() {
    let (tmp, layout) = initialized_project();
    let cfg = Config {
        enabled: false,
        ..config()
    };
    let sync = MemorySynchronizer::new(cfg, RecordingLauncher::default());
    let mut p = payload(tmp.path());
    p.prompt = Some("where were we?".into());

    for trigger in [
        Trigger::Init,
        Trigger::PromptObserved,
        Trigger::Idle,
        Trigger::PreCompact,
    ] {
        assert_eq!(
            sync.handle(trigger, &p, InvocationSource::Interactive),
            HookResponse::Nothing
        );
    }
    assert_eq!(sync.launcher().count(), 0);
    assert!(!layout.snapshot_path().exists());
}

// ────────────────────────────────────────────────────────────────────
// PromptObserved
// ────────────────────────────────────────────────────────────────────

#[test]
fn prompt_reminder_injected_for_decisions_only() {
    let (tmp, layout) = initialized_project();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let mut p = payload(tmp.path());

    p.prompt = Some("We decided to keep the lock in the state dir".into());
    let resp = sync.handle(Trigger::PromptObserved, &p, InvocationSource::Interactive);
    assert!(context_text(&resp).contains("Decisions"));

    p.prompt = Some("run the tests".into());
    assert_eq!(
        sync.handle(Trigger::PromptObserved, &p, InvocationSource::Interactive),
        HookResponse::Nothing
    );
    assert!(!layout.memory_path().exists());
}

// ────────────────────────────────────────────────────────────────────
// PreCompact + Init
// ────────────────────────────────────────────────────────────────────

#[test]
fn pre_compact_synthesizes_document_from_vcs() {
    let (tmp, layout) = initialized_project();
    let repo = Repository::init(tmp.path()).unwrap();
    for (i, msg) in ["one", "two", "three", "four"].iter().enumerate() {
        commit(&repo, &format!("f{i}.txt"), msg);
    }
    let branch = repo.head().unwrap().shorthand().unwrap().to_string();

    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let mut p = payload(tmp.path());
    p.trigger = Some("manual".into());

    let report = sync.pre_compact(&p).unwrap();
    assert!(report.snapshot_written);
    assert!(report.document_synthesized);

    let doc = MemoryDocument::parse(&std::fs::read_to_string(layout.memory_path()).unwrap());
    assert!(doc.context.contains(&format!("Branch: {branch}")));
    for msg in ["four", "three", "two"] {
        assert!(doc.context.contains(msg), "missing commit {msg}");
    }
    assert!(!doc.context.contains("one"));
    assert!(doc.current_focus.contains("not established"));

    let snap = SnapshotStore::new(layout.snapshot_path())
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(snap.trigger, "manual");
    assert_eq!(snap.session_id, "sess-a");
    assert!(snap.document.is_none());
    assert_eq!(snap.vcs.unwrap().branch, branch);
}

#[test]
fn pre_compact_keeps_existing_document() {
    let (tmp, layout) = initialized_project();
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Current Focus\n\nkeep me\n")
        .unwrap();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());

    let report = sync.pre_compact(&payload(tmp.path())).unwrap();
    assert!(report.snapshot_written);
    assert!(!report.document_synthesized);
    let snap = SnapshotStore::new(layout.snapshot_path())
        .load()
        .unwrap()
        .unwrap();
    assert!(snap.document.unwrap().contains("keep me"));
    assert!(snap.vcs.is_none());
}

#[test]
fn init_surfaces_snapshot_newer_than_document() {
    let (tmp, layout) = initialized_project();
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Current Focus\n\nbefore\n")
        .unwrap();
    age_file(&layout.memory_path(), Duration::from_secs(60));
    SnapshotStore::new(layout.snapshot_path())
        .write(&Snapshot::capture(
            "sess-old",
            "auto",
            Some("# Working Memory\n\n## Current Focus\n\ncaptured\n".into()),
            None,
        ))
        .unwrap();

    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let resp = sync.init(&payload(tmp.path())).unwrap();
    let text = context_text(&resp);
    assert!(text.contains("before"));
    assert!(text.contains("## Recovered Snapshot"));
    assert!(text.contains("captured"));

    // The next session does not see the same snapshot again.
    let resp = sync.init(&payload(tmp.path())).unwrap();
    let text = context_text(&resp);
    assert!(text.contains("before"));
    assert!(!text.contains("Recovered Snapshot"));
    assert!(layout.snapshot_path().exists());

    // A fresh compaction snapshot surfaces once more.
    std::thread::sleep(Duration::from_millis(5));
    SnapshotStore::new(layout.snapshot_path())
        .write(&Snapshot::capture(
            "sess-new",
            "manual",
            Some("# Working Memory\n\n## Current Focus\n\nrecaptured\n".into()),
            None,
        ))
        .unwrap();
    let output = sync.init(&payload(tmp.path())).unwrap();
    let text = context_text(&output);
    assert!(text.contains("recaptured"));

    // Once the document is rewritten after the snapshot, recovery stops.
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Current Focus\n\nafter\n")
        .unwrap();
    let resp = sync.init(&payload(tmp.path())).unwrap();
    assert!(!context_text(&resp).contains("Recovered Snapshot"));
}

#[test]
fn init_warns_about_stale_document_and_includes_patterns() {
    let (tmp, layout) = initialized_project();
    std::fs::write(layout.memory_path(), "# Working Memory\n\n## Decisions\n\n- flock\n").unwrap();
    std::fs::write(layout.patterns_path(), "- run clippy before commit\n").unwrap();
    age_file(&layout.memory_path(), Duration::from_secs(48 * 3600));

    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let resp = sync.handle(Trigger::Init, &payload(tmp.path()), InvocationSource::Interactive);
    let HookResponse::Context { trigger, text } = resp else {
        panic!("expected context");
    };
    assert_eq!(trigger, Trigger::Init);
    assert!(text.contains("last updated 48h ago"));
    assert!(text.contains("- flock"));
    assert!(text.contains("# Patterns"));
    assert!(text.contains("run clippy before commit"));
}

#[test]
fn init_synthesizes_in_memory_without_writing() {
    let (tmp, layout) = initialized_project();
    let repo = Repository::init(tmp.path()).unwrap();
    commit(&repo, "a.txt", "initial import");

    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    let resp = sync.init(&payload(tmp.path())).unwrap();
    let text = context_text(&resp);
    assert!(text.contains("## Current Focus"));
    assert!(text.contains("initial import"));
    assert!(text.contains("# Repository State"));
    assert!(!layout.memory_path().exists());
    assert!(!layout.snapshot_path().exists());
}

#[test]
fn init_with_nothing_to_say_replies_nothing() {
    let (tmp, _layout) = initialized_project();
    let sync = MemorySynchronizer::new(config(), RecordingLauncher::default());
    assert_eq!(
        sync.init(&payload(tmp.path())).unwrap(),
        HookResponse::Nothing
    );
}
