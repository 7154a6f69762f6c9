//! The uniform stage contract.
//!
//! Every sanitization transform, external tool or not, is invoked through
//! [`Stage`]: one input artifact in, one output artifact or a typed failure
//! out. The orchestrator never sees tool names, only stage identities and
//! outcomes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::StageFailure;

/// Identity of a pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageId {
    Unlock,
    Sanitize,
    AttachmentStrip,
    MetadataStrip,
    Rewrite,
    Relock,
}

impl StageId {
    pub fn number(&self) -> u8 {
        match self {
            StageId::Unlock => 0,
            StageId::Sanitize => 1,
            StageId::AttachmentStrip => 2,
            StageId::MetadataStrip => 3,
            StageId::Rewrite => 4,
            StageId::Relock => 5,
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            StageId::Unlock => "unlock",
            StageId::Sanitize => "sanitize",
            StageId::AttachmentStrip => "attachment-strip",
            StageId::MetadataStrip => "metadata-strip",
            StageId::Rewrite => "rewrite",
            StageId::Relock => "relock",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Read-only context a stage may consult during one invocation.
pub struct StageContext<'a> {
    pub run: &'a RunConfig,
    /// Per-item working directory with a unique name; stages may create
    /// scratch files under it.
    pub work_dir: &'a Path,
    /// Password recovered during the encryption check, if any.
    pub password: Option<&'a str>,
}

/// How a completed stage invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Applied,
    AppliedWithWarning(String),
    Skipped(String),
}

/// Result of a successful stage invocation.
#[derive(Debug)]
pub struct StageOutput {
    /// The artifact the next stage consumes.
    pub artifact: PathBuf,
    /// Embedded objects extracted by this stage, if it extracts any.
    pub attachments: Vec<PathBuf>,
    pub result: OutcomeKind,
}

impl StageOutput {
    pub fn applied(artifact: PathBuf) -> Self {
        Self {
            artifact,
            attachments: Vec::new(),
            result: OutcomeKind::Applied,
        }
    }

    pub fn skipped(artifact: PathBuf, detail: impl Into<String>) -> Self {
        Self {
            artifact,
            attachments: Vec::new(),
            result: OutcomeKind::Skipped(detail.into()),
        }
    }
}

/// Timestamped record of one stage invocation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: OutcomeKind,
}

/// One sanitization transform with a single invocation contract.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Consumes `input` and produces the next artifact at (or around) `out`.
    /// All external-tool failures must be converted into [`StageFailure`].
    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure>;
}

/// Probes whether an input artifact is password-protected.
#[async_trait]
pub trait EncryptionProbe: Send + Sync {
    async fn is_encrypted(&self, input: &Path) -> Result<bool, StageFailure>;
}

/// One implementation per stage, assembled once per run. Tests swap in
/// in-process fakes; production uses [`Toolbox::external`].
pub struct Toolbox {
    pub probe: Box<dyn EncryptionProbe>,
    pub unlock: Box<dyn Stage>,
    pub sanitize: Box<dyn Stage>,
    pub attachment_strip: Box<dyn Stage>,
    pub metadata_strip: Box<dyn Stage>,
    pub rewrite: Box<dyn Stage>,
    pub relock: Box<dyn Stage>,
}
