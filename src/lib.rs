//! Multi-stage PDF sanitization pipeline.
//!
//! Drives a sequence of external tools that each strip a class of risky or
//! identifying content while preserving visual layout. The library exposes
//! the pipeline orchestrator, the uniform stage contract, and the thin
//! plumbing around them (configuration, discovery, reporting).

pub mod config;
pub mod error;
pub mod fileset;
pub mod password;
pub mod pipeline;
pub mod report;
pub mod stage;
pub mod tools;

// Re-exports for crate consumers
pub use config::{Config, EncryptionStrength, QualityTier, RunConfig};
pub use error::{BootstrapError, DiscoveryError, Error, Result, StageFailure};
pub use fileset::WorkItem;
pub use password::{PasswordSource, TerminalPrompt};
pub use pipeline::Pipeline;
pub use report::{ItemRecord, ItemStatus, ReportSink, RunReport};
pub use stage::{
    EncryptionProbe, OutcomeKind, Stage, StageContext, StageId, StageOutcome, StageOutput, Toolbox,
};
