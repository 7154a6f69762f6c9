//! External-tool stage implementations.
//!
//! qpdf handles encryption probing, unlocking, structural sanitization and
//! relocking; pdfdetach extracts embedded files; exiftool scrubs metadata;
//! ghostscript re-distills the document to the target quality tier. Each
//! tool is an opaque transform behind the [`Stage`] contract.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use crate::error::StageFailure;
use crate::stage::{
    EncryptionProbe, OutcomeKind, Stage, StageContext, StageId, StageOutput, Toolbox,
};

const QPDF: &str = "qpdf";
const PDFDETACH: &str = "pdfdetach";
const EXIFTOOL: &str = "exiftool";
const GHOSTSCRIPT: &str = "gs";

/// qpdf reports success with warnings through a dedicated exit code.
const QPDF_EXIT_WARNINGS: i32 = 3;

async fn run_tool(mut cmd: Command, tool: &'static str) -> Result<Output, StageFailure> {
    debug!("invoking {:?}", cmd.as_std());
    cmd.output()
        .await
        .map_err(|source| StageFailure::Launch { tool, source })
}

fn stderr_detail(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn check_status(tool: &'static str, output: &Output) -> Result<(), StageFailure> {
    if output.status.success() {
        return Ok(());
    }
    Err(StageFailure::Tool {
        tool,
        code: output.status.code(),
        detail: stderr_detail(output),
    })
}

impl Toolbox {
    /// The production toolbox backed by the external collaborators.
    pub fn external() -> Self {
        Self {
            probe: Box::new(QpdfProbe),
            unlock: Box::new(QpdfUnlock),
            sanitize: Box::new(QpdfSanitize),
            attachment_strip: Box::new(PdfdetachStrip),
            metadata_strip: Box::new(ExiftoolScrub),
            rewrite: Box::new(GhostscriptRewrite),
            relock: Box::new(QpdfRelock),
        }
    }
}

/// `qpdf --is-encrypted`: exit 0 means encrypted, 2 means not encrypted.
pub struct QpdfProbe;

#[async_trait]
impl EncryptionProbe for QpdfProbe {
    async fn is_encrypted(&self, input: &Path) -> Result<bool, StageFailure> {
        let mut cmd = Command::new(QPDF);
        cmd.arg("--is-encrypted").arg(input);
        let output = run_tool(cmd, QPDF).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(2) => Ok(false),
            code => Err(StageFailure::Tool {
                tool: QPDF,
                code,
                detail: stderr_detail(&output),
            }),
        }
    }
}

/// Decrypts the input with the recovered password.
pub struct QpdfUnlock;

#[async_trait]
impl Stage for QpdfUnlock {
    fn id(&self) -> StageId {
        StageId::Unlock
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        let password = ctx.password.ok_or_else(|| StageFailure::BadPassword {
            detail: "no password available".into(),
        })?;
        let mut cmd = Command::new(QPDF);
        cmd.arg(format!("--password={password}"))
            .arg("--decrypt")
            .arg(input)
            .arg(out);

        let output = run_tool(cmd, QPDF).await?;
        match output.status.code() {
            Some(0) => Ok(StageOutput::applied(out.to_path_buf())),
            Some(QPDF_EXIT_WARNINGS) => Ok(StageOutput {
                artifact: out.to_path_buf(),
                attachments: Vec::new(),
                result: OutcomeKind::AppliedWithWarning(stderr_detail(&output)),
            }),
            _ => Err(StageFailure::BadPassword {
                detail: stderr_detail(&output),
            }),
        }
    }
}

/// Structural rewrite: linearizes and regenerates object streams, dropping
/// dangling objects and residual incremental-update artifacts.
pub struct QpdfSanitize;

#[async_trait]
impl Stage for QpdfSanitize {
    fn id(&self) -> StageId {
        StageId::Sanitize
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        _ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        let mut cmd = Command::new(QPDF);
        cmd.arg("--linearize")
            .arg("--object-streams=generate")
            .arg(input)
            .arg(out);
        let output = run_tool(cmd, QPDF).await?;
        match output.status.code() {
            Some(0) => Ok(StageOutput::applied(out.to_path_buf())),
            Some(QPDF_EXIT_WARNINGS) => Ok(StageOutput {
                artifact: out.to_path_buf(),
                attachments: Vec::new(),
                result: OutcomeKind::AppliedWithWarning(stderr_detail(&output)),
            }),
            code => Err(StageFailure::Tool {
                tool: QPDF,
                code,
                detail: stderr_detail(&output),
            }),
        }
    }
}

/// Extracts embedded files into the per-item working directory.
pub struct PdfdetachStrip;

#[async_trait]
impl Stage for PdfdetachStrip {
    fn id(&self) -> StageId {
        StageId::AttachmentStrip
    }

    async fn run(
        &self,
        input: &Path,
        _out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        let mut cmd = Command::new(PDFDETACH);
        cmd.arg("-list").arg(input);
        let output = run_tool(cmd, PDFDETACH).await?;
        check_status(PDFDETACH, &output)?;

        let listing = String::from_utf8_lossy(&output.stdout);
        let count = parse_embedded_count(&listing).unwrap_or(0);
        if count == 0 {
            // "nothing to strip" is success, not error
            return Ok(StageOutput::skipped(
                input.to_path_buf(),
                "no embedded files",
            ));
        }

        let extract_dir = ctx.work_dir.join("attachments");
        fs::create_dir_all(&extract_dir).await?;
        let mut cmd = Command::new(PDFDETACH);
        cmd.arg("-saveall").arg("-o").arg(&extract_dir).arg(input);
        let output = run_tool(cmd, PDFDETACH).await?;
        check_status(PDFDETACH, &output)?;

        let mut attachments = Vec::new();
        let mut entries = fs::read_dir(&extract_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            attachments.push(entry.path());
        }
        attachments.sort();

        Ok(StageOutput {
            artifact: input.to_path_buf(),
            attachments,
            result: OutcomeKind::Applied,
        })
    }
}

/// First line of `pdfdetach -list` reads "N embedded files".
fn parse_embedded_count(listing: &str) -> Option<usize> {
    listing
        .lines()
        .next()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Scrubs metadata fields with the configured exiftool argument set. The
/// tool rewrites the artifact in place, so the stage works on a copy and
/// leaves the `<file>_original` backup for the orchestrator to discard.
pub struct ExiftoolScrub;

#[async_trait]
impl Stage for ExiftoolScrub {
    fn id(&self) -> StageId {
        StageId::MetadataStrip
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        fs::copy(input, out).await?;
        let mut cmd = Command::new(EXIFTOOL);
        for arg in ctx.run.scrub_args.split_whitespace() {
            cmd.arg(arg);
        }
        cmd.arg(out);
        let output = run_tool(cmd, EXIFTOOL).await?;
        check_status(EXIFTOOL, &output)?;
        Ok(StageOutput::applied(out.to_path_buf()))
    }
}

/// Path of the pre-scrub backup exiftool leaves next to the artifact.
pub fn scrub_backup_path(artifact: &Path) -> PathBuf {
    let mut os = artifact.as_os_str().to_os_string();
    os.push("_original");
    PathBuf::from(os)
}

/// Re-distills the document to the requested quality tier. This is the
/// stage that writes the item's final output path.
pub struct GhostscriptRewrite;

#[async_trait]
impl Stage for GhostscriptRewrite {
    fn id(&self) -> StageId {
        StageId::Rewrite
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        let mut output_arg = OsString::from("-sOutputFile=");
        output_arg.push(out);
        let mut cmd = Command::new(GHOSTSCRIPT);
        cmd.arg("-dSAFER")
            .arg("-dNOPAUSE")
            .arg("-dBATCH")
            .arg("-dQUIET")
            .arg("-sDEVICE=pdfwrite")
            .arg("-dCompatibilityLevel=1.7")
            .arg(format!("-dPDFSETTINGS={}", ctx.run.quality.as_setting()))
            .arg(output_arg)
            .arg(input);
        let output = run_tool(cmd, GHOSTSCRIPT).await?;
        check_status(GHOSTSCRIPT, &output)?;
        Ok(StageOutput::applied(out.to_path_buf()))
    }
}

/// Re-encrypts the final output with the recovered password.
pub struct QpdfRelock;

#[async_trait]
impl Stage for QpdfRelock {
    fn id(&self) -> StageId {
        StageId::Relock
    }

    async fn run(
        &self,
        input: &Path,
        out: &Path,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageFailure> {
        let password = ctx.password.ok_or_else(|| StageFailure::BadPassword {
            detail: "no password available".into(),
        })?;
        let strength = ctx.run.encryption_strength;
        let mut cmd = Command::new(QPDF);
        if strength.is_weak() {
            cmd.arg("--allow-weak-crypto");
        }
        cmd.arg("--encrypt")
            .arg(password)
            .arg(password)
            .arg(strength.key_bits())
            .arg("--")
            .arg(input)
            .arg(out);
        let output = run_tool(cmd, QPDF).await?;
        check_status(QPDF, &output)?;
        Ok(StageOutput::applied(out.to_path_buf()))
    }
}
