//! Persisted configuration and run configuration resolution.
//!
//! The configuration lives in a JSON key/value document with the documented
//! SCREAMING_SNAKE_CASE surface. A missing file is materialized with defaults
//! exactly once (first-run bootstrapping never fails the invocation as long
//! as the file can be written).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BootstrapError;

/// Encryption key length applied when relocking the sanitized output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionStrength {
    #[serde(rename = "40")]
    Bits40,
    #[serde(rename = "128")]
    Bits128,
    #[serde(rename = "256")]
    Bits256,
}

impl EncryptionStrength {
    /// Key length as the external tool expects it on the command line.
    pub fn key_bits(&self) -> &'static str {
        match self {
            EncryptionStrength::Bits40 => "40",
            EncryptionStrength::Bits128 => "128",
            EncryptionStrength::Bits256 => "256",
        }
    }

    /// 40- and 128-bit RC4 need an explicit opt-in from modern qpdf.
    pub fn is_weak(&self) -> bool {
        !matches!(self, EncryptionStrength::Bits256)
    }
}

/// Re-distillation quality tier for the rewrite stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Screen,
    Ebook,
    Printer,
    Prepress,
}

impl QualityTier {
    /// Ghostscript `-dPDFSETTINGS` value.
    pub fn as_setting(&self) -> &'static str {
        match self {
            QualityTier::Screen => "/screen",
            QualityTier::Ebook => "/ebook",
            QualityTier::Printer => "/printer",
            QualityTier::Prepress => "/prepress",
        }
    }
}

/// The persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct Config {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub attachment_dir: Option<PathBuf>,
    pub relock_cleaned: bool,
    pub log_file: PathBuf,
    pub file_pattern: String,
    pub password_timeout: u64,
    pub dry_run: bool,
    pub output_prefix: String,
    pub mirror_dir_structure: bool,
    pub encryption_strength: EncryptionStrength,
    pub scrub_args: String,
    pub delete_attachments: bool,
    pub quality: QualityTier,
    pub cli_override: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            attachment_dir: None,
            relock_cleaned: false,
            log_file: PathBuf::from("pdfscrub.log"),
            file_pattern: "*.pdf".to_string(),
            password_timeout: 30,
            dry_run: false,
            output_prefix: "sanitized_".to_string(),
            mirror_dir_structure: false,
            encryption_strength: EncryptionStrength::Bits256,
            scrub_args: "-all=".to_string(),
            delete_attachments: false,
            quality: QualityTier::Ebook,
            cli_override: true,
        }
    }
}

impl Config {
    /// Loads the persisted configuration, materializing the documented
    /// defaults when the file does not exist yet. The default document is
    /// written exactly once, only in that branch.
    pub fn load_or_init(path: &Path) -> Result<Self, BootstrapError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Config::default();
                let document = serde_json::to_string_pretty(&config)
                    .expect("default config always serializes");
                fs::write(path, document).map_err(|source| BootstrapError::WriteConfig {
                    path: path.to_path_buf(),
                    source,
                })?;
                config.validate()?;
                return Ok(config);
            }
            Err(source) => {
                return Err(BootstrapError::ReadConfig {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Config =
            serde_json::from_str(&content).map_err(|source| BootstrapError::ParseConfig {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BootstrapError> {
        if self.password_timeout == 0 {
            return Err(BootstrapError::Validation(
                "PASSWORD_TIMEOUT must be at least 1 second".into(),
            ));
        }
        if self.file_pattern.trim().is_empty() {
            return Err(BootstrapError::Validation(
                "FILE_PATTERN must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Resolves the persisted configuration and an optional positional
    /// input/output pair into the immutable per-run configuration. The pair
    /// is honored only when CLI_OVERRIDE is enabled; all other values always
    /// come from the persisted document.
    pub fn resolve(&self, positional: Option<(PathBuf, PathBuf)>) -> RunConfig {
        let explicit = if self.cli_override { positional } else { None };
        RunConfig {
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            attachment_dir: self.attachment_dir.clone(),
            relock_cleaned: self.relock_cleaned,
            log_file: self.log_file.clone(),
            file_pattern: self.file_pattern.clone(),
            password_timeout: self.password_timeout,
            dry_run: self.dry_run,
            output_prefix: self.output_prefix.clone(),
            mirror_dir_structure: self.mirror_dir_structure,
            encryption_strength: self.encryption_strength,
            scrub_args: self.scrub_args.clone(),
            delete_attachments: self.delete_attachments,
            quality: self.quality,
            explicit,
        }
    }
}

/// Immutable configuration for one run. Built once, shared read-only by
/// every work item.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub attachment_dir: Option<PathBuf>,
    pub relock_cleaned: bool,
    pub log_file: PathBuf,
    pub file_pattern: String,
    pub password_timeout: u64,
    pub dry_run: bool,
    pub output_prefix: String,
    pub mirror_dir_structure: bool,
    pub encryption_strength: EncryptionStrength,
    pub scrub_args: String,
    pub delete_attachments: bool,
    pub quality: QualityTier,
    /// Explicit single-file (input, output) pair overriding batch discovery.
    pub explicit: Option<(PathBuf, PathBuf)>,
}
