//! Pipeline orchestrator: the per-item state machine.
//!
//! For each work item the orchestrator unlocks encrypted input behind a
//! bounded password wait, runs the fixed sanitize / attachment-strip /
//! metadata-strip / rewrite sequence, optionally relocks the output, and
//! cleans up intermediate artifacts. A failing stage is terminal for its
//! item only; the run always moves on to the next item.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::time::timeout;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::fileset::WorkItem;
use crate::password::PasswordSource;
use crate::report::{ItemRecord, ItemStatus, ReportSink, RunReport};
use crate::stage::{OutcomeKind, Stage, StageContext, StageId, StageOutcome, StageOutput, Toolbox};
use crate::tools::scrub_backup_path;

/// Orchestrates the stage sequence for every work item of a run.
pub struct Pipeline {
    run: Arc<RunConfig>,
    toolbox: Toolbox,
    passwords: Arc<dyn PasswordSource>,
    sink: Arc<ReportSink>,
}

/// Mutable per-item processing state. Owned exclusively by the orchestrator
/// invocation handling the item, never shared or reused.
struct PipelineState {
    /// The file the next stage consumes.
    artifact: PathBuf,
    /// Set only when the item was encrypted and successfully unlocked.
    password: Option<String>,
    outcomes: Vec<StageOutcome>,
    /// Per-item working directory with a unique name.
    work_dir: PathBuf,
    /// Intermediate artifacts to remove during cleanup.
    scratch: Vec<PathBuf>,
}

impl PipelineState {
    fn create(input: &Path) -> std::io::Result<Self> {
        let work_dir = std::env::temp_dir().join(format!("pdfscrub-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self {
            artifact: input.to_path_buf(),
            password: None,
            outcomes: Vec::new(),
            work_dir,
            scratch: Vec::new(),
        })
    }

    fn stage_path(&self, id: StageId) -> PathBuf {
        self.work_dir
            .join(format!("stage{}-{}.pdf", id.number(), id.slug()))
    }
}

impl Pipeline {
    pub fn new(
        run: Arc<RunConfig>,
        toolbox: Toolbox,
        passwords: Arc<dyn PasswordSource>,
        sink: Arc<ReportSink>,
    ) -> Self {
        Self {
            run,
            toolbox,
            passwords,
            sink,
        }
    }

    /// Processes every item in order and returns the accumulated report.
    /// Items are independent; a failure never stops the run.
    pub async fn execute(&self, items: &[WorkItem]) -> RunReport {
        let mut report = RunReport::new();
        self.sink
            .info(None, &format!("run started with {} item(s)", items.len()));

        for item in items {
            let record = self.process_item(item).await;
            report.push(record);
        }

        report.finish();
        self.sink.info(
            None,
            &format!(
                "run finished: {} succeeded, {} skipped, {} failed",
                report.succeeded(),
                report.skipped(),
                report.failed()
            ),
        );
        report
    }

    #[instrument(skip_all, fields(item = %item.input.display()))]
    async fn process_item(&self, item: &WorkItem) -> ItemRecord {
        let started_at = Utc::now();
        self.sink.info(Some(&item.input), "processing started");

        // Dry run short-circuits before any probe, stage, or filesystem
        // mutation other than the log itself.
        if self.run.dry_run {
            self.sink.info(
                Some(&item.input),
                &format!("dry run: would process into '{}'", item.output.display()),
            );
            return self.finish_record(item, ItemStatus::Succeeded, Vec::new(), started_at);
        }

        let mut state = match PipelineState::create(&item.input) {
            Ok(state) => state,
            Err(e) => {
                return self.finish_record(
                    item,
                    ItemStatus::Failed(format!("cannot create working directory: {e}")),
                    Vec::new(),
                    started_at,
                )
            }
        };

        let status = self.drive(item, &mut state).await;
        self.cleanup(item, &state).await;
        let outcomes = std::mem::take(&mut state.outcomes);
        self.finish_record(item, status, outcomes, started_at)
    }

    /// Runs the state machine proper: EncryptionCheck, the sanitization
    /// sequence, Rewrite and the optional Relock.
    async fn drive(&self, item: &WorkItem, state: &mut PipelineState) -> ItemStatus {
        // EncryptionCheck
        match self.toolbox.probe.is_encrypted(&item.input).await {
            Err(e) => return ItemStatus::Failed(format!("encryption probe failed: {e}")),
            Ok(false) => self.sink.info(Some(&item.input), "input is not encrypted"),
            Ok(true) => {
                self.sink
                    .info(Some(&item.input), "input is encrypted, requesting password");
                let wait = Duration::from_secs(self.run.password_timeout);
                let entered = match timeout(wait, self.passwords.request(&item.input)).await {
                    Err(_) => return ItemStatus::Skipped("password timeout".into()),
                    Ok(None) => return ItemStatus::Skipped("no password provided".into()),
                    Ok(Some(entered)) => entered,
                };

                let out = state.stage_path(StageId::Unlock);
                let unlocked = self
                    .run_stage(
                        item,
                        self.toolbox.unlock.as_ref(),
                        &item.input,
                        &out,
                        &state.work_dir,
                        Some(entered.as_str()),
                    )
                    .await;
                match unlocked {
                    Err(e) => return ItemStatus::Skipped(format!("decryption failed: {e}")),
                    Ok((outcome, output)) => {
                        state.outcomes.push(outcome);
                        state.scratch.push(output.artifact.clone());
                        state.artifact = output.artifact;
                        state.password = Some(entered);
                        self.sink.info(Some(&item.input), "unlocked");
                    }
                }
            }
        }

        // Sanitize -> AttachmentStrip -> MetadataStrip, fixed order.
        let stages = [
            &self.toolbox.sanitize,
            &self.toolbox.attachment_strip,
            &self.toolbox.metadata_strip,
        ];
        for stage in stages {
            let id = stage.id();
            let out = state.stage_path(id);
            let ran = self
                .run_stage(
                    item,
                    stage.as_ref(),
                    &state.artifact,
                    &out,
                    &state.work_dir,
                    state.password.as_deref(),
                )
                .await;
            match ran {
                Err(e) => return ItemStatus::Failed(format!("{id} failed: {e}")),
                Ok((outcome, output)) => {
                    state.outcomes.push(outcome);
                    if output.artifact != state.artifact {
                        state.scratch.push(output.artifact.clone());
                        state.artifact = output.artifact;
                    }
                    if id == StageId::AttachmentStrip && !output.attachments.is_empty() {
                        self.dispose_attachments(item, &output.attachments).await;
                    }
                    if id == StageId::MetadataStrip {
                        self.discard_scrub_backup(item, &state.artifact).await;
                    }
                    self.snapshot(item, &state.artifact, id).await;
                }
            }
        }

        // Rewrite writes the final destination; prior stages only touched
        // working artifacts, so the output tree is created here at the
        // latest possible moment.
        if let Some(parent) = item.output.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent).await {
                    return ItemStatus::Failed(format!("cannot create output directory: {e}"));
                }
            }
        }
        let rewritten = self
            .run_stage(
                item,
                self.toolbox.rewrite.as_ref(),
                &state.artifact,
                &item.output,
                &state.work_dir,
                state.password.as_deref(),
            )
            .await;
        match rewritten {
            Err(e) => return ItemStatus::Failed(format!("rewrite failed: {e}")),
            Ok((outcome, _output)) => {
                state.outcomes.push(outcome);
                self.snapshot(item, &item.output, StageId::Rewrite).await;
            }
        }

        // Relock only with an explicit request and a recovered password;
        // anything else is a no-op, and failure leaves the item succeeded.
        if self.run.relock_cleaned {
            match state.password.clone() {
                None => self.sink.info(
                    Some(&item.input),
                    "relock requested but no password was recovered, skipping",
                ),
                Some(password) => {
                    let relocked = state.stage_path(StageId::Relock);
                    let ran = self
                        .run_stage(
                            item,
                            self.toolbox.relock.as_ref(),
                            &item.output,
                            &relocked,
                            &state.work_dir,
                            Some(password.as_str()),
                        )
                        .await;
                    match ran {
                        Err(e) => self
                            .sink
                            .warning(Some(&item.input), &format!("relock failed: {e}")),
                        Ok((outcome, output)) => {
                            state.outcomes.push(outcome);
                            state.scratch.push(output.artifact.clone());
                            match fs::copy(&output.artifact, &item.output).await {
                                Ok(_) => self.sink.info(
                                    Some(&item.input),
                                    "relocked output with recovered password",
                                ),
                                Err(e) => self.sink.warning(
                                    Some(&item.input),
                                    &format!("could not replace output with relocked copy: {e}"),
                                ),
                            }
                        }
                    }
                }
            }
        }

        ItemStatus::Succeeded
    }

    /// Invokes one stage and wraps timing into an appended outcome. Failures
    /// carry no outcome; the caller decides the item's terminal status.
    async fn run_stage(
        &self,
        item: &WorkItem,
        stage: &dyn Stage,
        input: &Path,
        out: &Path,
        work_dir: &Path,
        password: Option<&str>,
    ) -> Result<(StageOutcome, StageOutput), crate::error::StageFailure> {
        let ctx = StageContext {
            run: &self.run,
            work_dir,
            password,
        };
        let id = stage.id();
        let started_at = Utc::now();
        let output = stage.run(input, out, &ctx).await?;
        let outcome = StageOutcome {
            stage: id,
            started_at,
            finished_at: Utc::now(),
            result: output.result.clone(),
        };

        match &output.result {
            OutcomeKind::Applied => self
                .sink
                .info(Some(&item.input), &format!("stage {id} applied")),
            OutcomeKind::AppliedWithWarning(detail) => self.sink.warning(
                Some(&item.input),
                &format!("stage {id} applied with warning: {detail}"),
            ),
            OutcomeKind::Skipped(detail) => self
                .sink
                .info(Some(&item.input), &format!("stage {id} skipped: {detail}")),
        }
        Ok((outcome, output))
    }

    /// Disposal precedence: configured attachment directory, then deletion,
    /// then leaving the extracted files where they are. Best-effort.
    async fn dispose_attachments(&self, item: &WorkItem, attachments: &[PathBuf]) {
        if let Some(dir) = &self.run.attachment_dir {
            if let Err(e) = fs::create_dir_all(dir).await {
                self.sink.warning(
                    Some(&item.input),
                    &format!("cannot create attachment directory '{}': {e}", dir.display()),
                );
                return;
            }
            for path in attachments {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string());
                let mut dest = dir.join(&name);
                if fs::try_exists(&dest).await.unwrap_or(false) {
                    dest = dir.join(format!("{}-{}", Uuid::new_v4(), name));
                }
                let moved = match fs::rename(path, &dest).await {
                    Ok(()) => Ok(()),
                    // rename fails across filesystems; fall back to copy+remove
                    Err(_) => match fs::copy(path, &dest).await {
                        Ok(_) => fs::remove_file(path).await,
                        Err(e) => Err(e),
                    },
                };
                match moved {
                    Ok(()) => self.sink.info(
                        Some(&item.input),
                        &format!("attachment '{name}' moved to '{}'", dest.display()),
                    ),
                    Err(e) => self.sink.warning(
                        Some(&item.input),
                        &format!("could not move attachment '{name}': {e}"),
                    ),
                }
            }
        } else if self.run.delete_attachments {
            for path in attachments {
                match fs::remove_file(path).await {
                    Ok(()) => self.sink.info(
                        Some(&item.input),
                        &format!("attachment '{}' deleted", path.display()),
                    ),
                    Err(e) => self.sink.warning(
                        Some(&item.input),
                        &format!("could not delete attachment '{}': {e}", path.display()),
                    ),
                }
            }
        } else {
            let location = attachments
                .first()
                .and_then(|p| p.parent())
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            self.sink.info(
                Some(&item.input),
                &format!(
                    "leaving {} extracted attachment(s) in '{location}'",
                    attachments.len()
                ),
            );
        }
    }

    /// The metadata tool keeps a pre-scrub backup next to the artifact; it
    /// holds exactly the content the scrub removed, so it must not outlive
    /// the stage.
    async fn discard_scrub_backup(&self, item: &WorkItem, artifact: &Path) {
        let backup = scrub_backup_path(artifact);
        match fs::remove_file(&backup).await {
            Ok(()) => self
                .sink
                .info(Some(&item.input), "discarded metadata tool backup"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => self.sink.warning(
                Some(&item.input),
                &format!(
                    "could not discard metadata tool backup '{}': {e}",
                    backup.display()
                ),
            ),
        }
    }

    /// Audit snapshot of the current working artifact, tagged with the stage
    /// number. Failures are warnings only.
    async fn snapshot(&self, item: &WorkItem, artifact: &Path, id: StageId) {
        let parent = item.output.parent().unwrap_or_else(|| Path::new("."));
        let stem = item
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_string());
        let dir = parent.join(".stages").join(stem);
        let dest = dir.join(format!("stage{}-{}.pdf", id.number(), id.slug()));

        let copied = async {
            fs::create_dir_all(&dir).await?;
            fs::copy(artifact, &dest).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = copied {
            self.sink.warning(
                Some(&item.input),
                &format!("snapshot for stage {id} failed: {e}"),
            );
        }
    }

    /// Removes working artifacts that are not the final output. Best-effort;
    /// attachments intentionally left in place keep the work dir non-empty
    /// and therefore alive.
    async fn cleanup(&self, item: &WorkItem, state: &PipelineState) {
        for path in &state.scratch {
            if path == &item.output {
                continue;
            }
            let backup = scrub_backup_path(path);
            let _ = fs::remove_file(&backup).await;
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => self.sink.warning(
                    Some(&item.input),
                    &format!("cleanup failed for '{}': {e}", path.display()),
                ),
            }
        }
        let _ = fs::remove_dir(state.work_dir.join("attachments")).await;
        if let Err(e) = fs::remove_dir(&state.work_dir).await {
            if e.kind() != ErrorKind::NotFound {
                debug!(
                    "work dir '{}' retained: {e}",
                    state.work_dir.display()
                );
            }
        }
    }

    fn finish_record(
        &self,
        item: &WorkItem,
        status: ItemStatus,
        outcomes: Vec<StageOutcome>,
        started_at: chrono::DateTime<Utc>,
    ) -> ItemRecord {
        match &status {
            ItemStatus::Succeeded => self
                .sink
                .info(Some(&item.input), &format!("final status: {status}")),
            ItemStatus::Skipped(_) => self
                .sink
                .warning(Some(&item.input), &format!("final status: {status}")),
            ItemStatus::Failed(_) => self
                .sink
                .error(Some(&item.input), &format!("final status: {status}")),
            _ => {}
        }
        ItemRecord {
            input: item.input.clone(),
            output: item.output.clone(),
            status,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
