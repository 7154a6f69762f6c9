//! Work item discovery.
//!
//! Resolves the run configuration into the ordered list of (input, output)
//! pairs before any processing starts. Ordering is lexicographic over the
//! discovered input paths so logs and reports are reproducible.

use std::path::{Path, PathBuf};

use glob::Pattern;
use walkdir::WalkDir;

use crate::config::RunConfig;
use crate::error::DiscoveryError;

/// One input/output pair to be processed independently. Immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Subdirectory of the input relative to INPUT_DIR, kept for mirroring.
    pub rel_dir: Option<PathBuf>,
}

impl WorkItem {
    /// Short display name used in logs and report entries.
    pub fn name(&self) -> String {
        self.input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input.display().to_string())
    }
}

/// Produces the ordered work item list for a run.
///
/// An explicit pair short-circuits discovery; otherwise the input directory
/// is walked recursively and file names are matched against FILE_PATTERN.
/// Zero matches in batch mode is fatal for the run.
pub fn resolve(run: &RunConfig) -> Result<Vec<WorkItem>, DiscoveryError> {
    if let Some((input, output)) = &run.explicit {
        return Ok(vec![WorkItem {
            input: input.clone(),
            output: output.clone(),
            rel_dir: None,
        }]);
    }

    let pattern =
        Pattern::new(&run.file_pattern).map_err(|source| DiscoveryError::BadPattern {
            pattern: run.file_pattern.clone(),
            source,
        })?;

    let mut items = Vec::new();
    for entry in WalkDir::new(&run.input_dir).sort_by_file_name() {
        let entry = entry.map_err(|source| DiscoveryError::Walk {
            dir: run.input_dir.clone(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !pattern.matches(&name) {
            continue;
        }
        items.push(work_item_for(run, entry.path(), &name));
    }

    if items.is_empty() {
        return Err(DiscoveryError::NoMatches {
            pattern: run.file_pattern.clone(),
            dir: run.input_dir.clone(),
        });
    }

    items.sort_by(|a, b| a.input.cmp(&b.input));
    Ok(items)
}

fn work_item_for(run: &RunConfig, input: &Path, name: &str) -> WorkItem {
    let rel_dir = input
        .strip_prefix(&run.input_dir)
        .ok()
        .and_then(|rel| rel.parent())
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf);

    let file_name = format!("{}{}", run.output_prefix, name);
    let output = match (&rel_dir, run.mirror_dir_structure) {
        (Some(rel), true) => run.output_dir.join(rel).join(file_name),
        _ => run.output_dir.join(file_name),
    };

    WorkItem {
        input: input.to_path_buf(),
        output,
        rel_dir,
    }
}
