//! Orchestrator state machine tests with in-process fake stages.
//!
//! The external binaries are never invoked here; every stage is a fake that
//! copies, fails, extracts, or no-ops so the per-item state machine can be
//! exercised deterministically over tempfile trees.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use pdfscrub::fileset::{self, WorkItem};
use pdfscrub::password::PasswordSource;
use pdfscrub::pipeline::Pipeline;
use pdfscrub::report::{ItemStatus, ReportSink, RunReport};
use pdfscrub::stage::{
    EncryptionProbe, OutcomeKind, Stage, StageContext, StageId, StageOutput, Toolbox,
};
use pdfscrub::tools::scrub_backup_path;
use pdfscrub::{Config, RunConfig, StageFailure};
use tempfile::{tempdir, TempDir};

// ---------------------------------------------------------------- fakes

struct FakeProbe {
    encrypted: Vec<String>,
}

impl FakeProbe {
    fn boxed(encrypted: &[&str]) -> Box<Self> {
        Box::new(Self {
            encrypted: encrypted.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl EncryptionProbe for FakeProbe {
    async fn is_encrypted(&self, input: &Path) -> Result<bool, StageFailure> {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.encrypted.contains(&name))
    }
}

enum FakeBehavior {
    /// Copy the input to the requested output path.
    Copy,
    /// Copy, and leave a pre-scrub backup next to the output.
    CopyWithBackup,
    /// Fail with the given detail.
    Fail(&'static str),
    /// Fail only for inputs whose file name matches; copy otherwise.
    FailFor(&'static str),
    /// Successful no-op with a skipped outcome.
    NoOp(&'static str),
    /// Write the named files under the work dir and return them as
    /// extracted attachments; the artifact passes through unchanged.
    Extract(Vec<&'static str>),
}

struct FakeStage {
    id: StageId,
    behavior: FakeBehavior,
    calls: Arc<AtomicUsize>,
    /// Paths this stage created, for post-run assertions.
    created: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeStage {
    fn boxed(id: StageId, behavior: FakeBehavior) -> Box<Self> {
        Box::new(Self {
            id,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn created(&self) -> Arc<Mutex<Vec<PathBuf>>> {
        self.created.clone()
    }
}

#[async_trait]
impl Stage for FakeStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            FakeBehavior::Copy => {
                std::fs::copy(input, out)?;
                Ok(StageOutput::applied(out.to_path_buf()))
            }
            FakeBehavior::CopyWithBackup => {
                std::fs::copy(input, out)?;
                let backup = scrub_backup_path(out);
                std::fs::write(&backup, b"pre-scrub")?;
                self.created.lock().unwrap().push(backup);
                Ok(StageOutput::applied(out.to_path_buf()))
            }
            FakeBehavior::Fail(detail) => Err(StageFailure::Tool {
                tool: "fake",
                code: Some(1),
                detail: detail.to_string(),
            }),
            FakeBehavior::FailFor(name) => {
                let matches = input.file_name().is_some_and(|f| f.to_string_lossy() == *name);
                if matches {
                    Err(StageFailure::Tool {
                        tool: "fake",
                        code: Some(1),
                        detail: format!("injected failure for {name}"),
                    })
                } else {
                    std::fs::copy(input, out)?;
                    Ok(StageOutput::applied(out.to_path_buf()))
                }
            }
            FakeBehavior::NoOp(detail) => Ok(StageOutput::skipped(input.to_path_buf(), *detail)),
            FakeBehavior::Extract(names) => {
                let dir = ctx.work_dir.join("attachments");
                std::fs::create_dir_all(&dir)?;
                let mut attachments = Vec::new();
                for name in names {
                    let path = dir.join(name);
                    std::fs::write(&path, b"payload")?;
                    self.created.lock().unwrap().push(path.clone());
                    attachments.push(path);
                }
                Ok(StageOutput {
                    artifact: input.to_path_buf(),
                    attachments,
                    result: OutcomeKind::Applied,
                })
            }
        }
    }
}

/// Unlock that accepts exactly one password.
struct FakeUnlock {
    expected: &'static str,
}

#[async_trait]
impl Stage for FakeUnlock {
    fn id(&self) -> StageId {
        StageId::Unlock
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        if ctx.password != Some(self.expected) {
            return Err(StageFailure::BadPassword {
                detail: "invalid password".into(),
            });
        }
        std::fs::copy(input, out)?;
        Ok(StageOutput::applied(out.to_path_buf()))
    }
}

struct QueuedPassword(Option<String>);

#[async_trait]
impl PasswordSource for QueuedPassword {
    async fn request(&self, _input: &Path) -> Option<String> {
        self.0.clone()
    }
}

struct NeverAnswers;

#[async_trait]
impl PasswordSource for NeverAnswers {
    async fn request(&self, _input: &Path) -> Option<String> {
        std::future::pending().await
    }
}

struct PanicsIfAsked;

#[async_trait]
impl PasswordSource for PanicsIfAsked {
    async fn request(&self, input: &Path) -> Option<String> {
        panic!("password requested for unencrypted input {}", input.display());
    }
}

// ---------------------------------------------------------------- harness

fn base_toolbox(encrypted: &[&str]) -> Toolbox {
    Toolbox {
        probe: FakeProbe::boxed(encrypted),
        unlock: Box::new(FakeUnlock { expected: "x" }),
        sanitize: FakeStage::boxed(StageId::Sanitize, FakeBehavior::Copy),
        attachment_strip: FakeStage::boxed(
            StageId::AttachmentStrip,
            FakeBehavior::NoOp("no embedded files"),
        ),
        metadata_strip: FakeStage::boxed(StageId::MetadataStrip, FakeBehavior::Copy),
        rewrite: FakeStage::boxed(StageId::Rewrite, FakeBehavior::Copy),
        relock: FakeStage::boxed(StageId::Relock, FakeBehavior::Copy),
    }
}

fn run_config(root: &Path) -> RunConfig {
    let mut config = Config::default();
    config.input_dir = root.join("in");
    config.output_dir = root.join("out");
    config.log_file = root.join("run.log");
    config.password_timeout = 1;
    config.resolve(None)
}

fn write_input(root: &Path, name: &str) {
    let dir = root.join("in");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), b"%PDF-1.4 fixture").unwrap();
}

async fn execute(
    run: RunConfig,
    toolbox: Toolbox,
    passwords: Arc<dyn PasswordSource>,
) -> (RunReport, Vec<WorkItem>) {
    let sink = Arc::new(ReportSink::open(&run.log_file).unwrap());
    let items = fileset::resolve(&run).unwrap();
    let pipeline = Pipeline::new(Arc::new(run), toolbox, passwords, sink);
    let report = pipeline.execute(&items).await;
    (report, items)
}

fn read_log(root: &Path) -> String {
    std::fs::read_to_string(root.join("run.log")).unwrap()
}

fn fixture() -> TempDir {
    tempdir().unwrap()
}

// ---------------------------------------------------------------- tests

#[tokio::test]
async fn dry_run_touches_nothing_but_the_log() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let mut run = run_config(root.path());
    run.dry_run = true;

    let (report, items) = execute(run, base_toolbox(&[]), Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(items.len(), 1);
    assert!(!items[0].output.exists());
    assert!(!root.path().join("out").exists());
    assert!(read_log(root.path()).contains("dry run: would process"));
}

#[tokio::test]
async fn unencrypted_input_never_prompts() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    let (report, items) = execute(run, base_toolbox(&[]), Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    assert!(items[0].output.exists());
    let log = read_log(root.path());
    assert!(log.contains("input is not encrypted"));
    assert!(!log.contains("unlocked"));
}

#[tokio::test]
async fn wrong_password_skips_the_item() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    let (report, items) = execute(
        run,
        base_toolbox(&["a.pdf"]),
        Arc::new(QueuedPassword(Some("wrong".into()))),
    )
    .await;

    assert_eq!(report.skipped(), 1);
    match &report.items[0].status {
        ItemStatus::Skipped(reason) => assert!(reason.contains("decryption failed")),
        other => panic!("expected skipped, got {other:?}"),
    }
    assert!(!items[0].output.exists());
}

#[tokio::test]
async fn password_wait_is_bounded_by_the_timeout() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    let started = Instant::now();
    let (report, items) = execute(run, base_toolbox(&["a.pdf"]), Arc::new(NeverAnswers)).await;

    assert!(started.elapsed().as_secs() < 5, "wait was not bounded");
    assert_eq!(report.skipped(), 1);
    assert_eq!(
        report.items[0].status,
        ItemStatus::Skipped("password timeout".into())
    );
    assert!(!items[0].output.exists());
}

#[tokio::test]
async fn recovered_password_unlocks_and_relocks() {
    let root = fixture();
    write_input(root.path(), "b.pdf");
    let mut run = run_config(root.path());
    run.relock_cleaned = true;

    let mut toolbox = base_toolbox(&["b.pdf"]);
    let relock = FakeStage::boxed(StageId::Relock, FakeBehavior::Copy);
    let relock_calls = relock.calls();
    toolbox.relock = relock;

    let (report, items) = execute(
        run,
        toolbox,
        Arc::new(QueuedPassword(Some("x".into()))),
    )
    .await;

    assert_eq!(report.succeeded(), 1);
    assert!(items[0].output.exists());
    assert_eq!(relock_calls.load(Ordering::SeqCst), 1);
    let log = read_log(root.path());
    assert!(log.contains("unlocked"));
    assert!(log.contains("relocked output with recovered password"));
}

#[tokio::test]
async fn relock_without_recovered_password_is_a_noop() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let mut run = run_config(root.path());
    run.relock_cleaned = true;

    let mut toolbox = base_toolbox(&[]);
    let relock = FakeStage::boxed(StageId::Relock, FakeBehavior::Copy);
    let relock_calls = relock.calls();
    toolbox.relock = relock;

    let (report, _) = execute(run, toolbox, Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(relock_calls.load(Ordering::SeqCst), 0);
    assert!(read_log(root.path()).contains("no password was recovered"));
}

#[tokio::test]
async fn relock_failure_leaves_the_item_succeeded() {
    let root = fixture();
    write_input(root.path(), "b.pdf");
    let mut run = run_config(root.path());
    run.relock_cleaned = true;

    let mut toolbox = base_toolbox(&["b.pdf"]);
    toolbox.relock = FakeStage::boxed(StageId::Relock, FakeBehavior::Fail("relock exploded"));

    let (report, items) = execute(
        run,
        toolbox,
        Arc::new(QueuedPassword(Some("x".into()))),
    )
    .await;

    assert_eq!(report.succeeded(), 1);
    assert!(items[0].output.exists());
    assert!(read_log(root.path()).contains("relock failed"));
}

#[tokio::test]
async fn stage_failure_is_contained_to_the_item() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    write_input(root.path(), "b.pdf");
    let run = run_config(root.path());

    let mut toolbox = base_toolbox(&[]);
    toolbox.sanitize = FakeStage::boxed(StageId::Sanitize, FakeBehavior::FailFor("a.pdf"));

    let (report, items) = execute(run, toolbox, Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
    assert!(report.has_failures());
    // Items are processed in lexicographic order; a.pdf failed, b.pdf ran.
    assert!(!items[0].output.exists());
    assert!(items[1].output.exists());
}

#[tokio::test]
async fn attachments_move_to_the_configured_directory() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let mut run = run_config(root.path());
    run.attachment_dir = Some(root.path().join("attach"));

    let mut toolbox = base_toolbox(&[]);
    toolbox.attachment_strip = FakeStage::boxed(
        StageId::AttachmentStrip,
        FakeBehavior::Extract(vec!["inner.txt"]),
    );

    let (report, _) = execute(run, toolbox, Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    assert!(root.path().join("attach/inner.txt").exists());
}

#[tokio::test]
async fn attachments_deleted_when_configured() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let mut run = run_config(root.path());
    run.delete_attachments = true;

    let mut toolbox = base_toolbox(&[]);
    let strip = FakeStage::boxed(
        StageId::AttachmentStrip,
        FakeBehavior::Extract(vec!["inner.txt"]),
    );
    let created = strip.created();
    toolbox.attachment_strip = strip;

    let (report, _) = execute(run, toolbox, Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    for path in created.lock().unwrap().iter() {
        assert!(!path.exists(), "attachment '{}' survived", path.display());
    }
}

#[tokio::test]
async fn attachments_left_in_place_by_default() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    let mut toolbox = base_toolbox(&[]);
    let strip = FakeStage::boxed(
        StageId::AttachmentStrip,
        FakeBehavior::Extract(vec!["inner.txt"]),
    );
    let created = strip.created();
    toolbox.attachment_strip = strip;

    let (report, _) = execute(run, toolbox, Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    let created = created.lock().unwrap();
    assert!(!created.is_empty());
    for path in created.iter() {
        assert!(path.exists(), "attachment '{}' was removed", path.display());
        std::fs::remove_file(path).ok();
    }
}

#[tokio::test]
async fn metadata_tool_backup_is_discarded() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    let mut toolbox = base_toolbox(&[]);
    let scrub = FakeStage::boxed(StageId::MetadataStrip, FakeBehavior::CopyWithBackup);
    let created = scrub.created();
    toolbox.metadata_strip = scrub;

    let (report, _) = execute(run, toolbox, Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    let created = created.lock().unwrap();
    assert!(!created.is_empty());
    for backup in created.iter() {
        assert!(!backup.exists(), "backup '{}' survived", backup.display());
    }
}

#[tokio::test]
async fn no_attachments_is_success_not_error() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    // base toolbox already answers "no embedded files"
    let (report, items) = execute(run, base_toolbox(&[]), Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    assert!(items[0].output.exists());
    let skipped_outcome = report.items[0]
        .outcomes
        .iter()
        .find(|o| o.stage == StageId::AttachmentStrip)
        .unwrap();
    assert_eq!(
        skipped_outcome.result,
        OutcomeKind::Skipped("no embedded files".into())
    );
}

#[tokio::test]
async fn snapshots_are_captured_per_stage() {
    let root = fixture();
    write_input(root.path(), "a.pdf");
    let run = run_config(root.path());

    let (report, _) = execute(run, base_toolbox(&[]), Arc::new(PanicsIfAsked)).await;

    assert_eq!(report.succeeded(), 1);
    let snapshot_dir = root.path().join("out/.stages/sanitized_a");
    assert!(snapshot_dir.join("stage1-sanitize.pdf").exists());
    assert!(snapshot_dir.join("stage4-rewrite.pdf").exists());
}

#[tokio::test]
async fn batch_example_end_to_end() {
    // a.pdf unencrypted, b.pdf encrypted with password "x": both succeed,
    // the log shows an "unlocked" entry only for b.pdf.
    let root = fixture();
    write_input(root.path(), "a.pdf");
    write_input(root.path(), "b.pdf");
    let run = run_config(root.path());
    let out = root.path().join("out");

    let (report, _) = execute(
        run,
        base_toolbox(&["b.pdf"]),
        Arc::new(QueuedPassword(Some("x".into()))),
    )
    .await;

    assert_eq!(report.succeeded(), 2);
    assert!(out.join("sanitized_a.pdf").exists());
    assert!(out.join("sanitized_b.pdf").exists());
    let log = read_log(root.path());
    assert!(log.contains("b.pdf: unlocked"));
    assert!(!log.contains("a.pdf: unlocked"));
}
