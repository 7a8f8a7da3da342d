use crate::workers::WorkerId;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

/// marker file written after input staging completes
pub const DEFAULT_STAGE_MARKER: &str = ".copy_parent_staged";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging io failure")]
    Io(#[from] io::Error),
}

/// Render a sorted set of row indices as a compact range string: runs of
/// consecutive indices collapse to "lo-hi", singletons stay bare, groups are
/// joined with underscores. Pure formatting, used for working directory
/// names and logs.
pub fn compact_range(rows: &[usize]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = rows.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }

    parts.join("_")
}

/// Name of the working directory for one dispatched work item.
pub fn task_dir_name(prefix: &str, worker: WorkerId, rows: &[usize]) -> String {
    format!("{prefix}{}_worker{worker}", compact_range(rows))
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), StagingError> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Copy all files from `source` into `target`, creating `target` if absent,
/// then drop an empty marker file named `marker` inside it. The marker is
/// written strictly after the copies so a concurrent observer never sees it
/// guard files that are not there yet.
pub fn stage_input(source: &Path, target: &Path, marker: &str) -> Result<(), StagingError> {
    copy_tree(source, target).map_err(|staging_error| {
        error!(source = ?source, target = ?target, "failed to stage input files");
        staging_error
    })?;
    fs::File::create(target.join(marker))?;

    debug!(target = ?target, "staged input files");

    Ok(())
}

/// Tear down a task working directory: remove the staging marker if one is
/// present (a missing marker is not an error, repeated calls are no-ops) and
/// optionally copy everything back out.
pub fn unstage_output(
    working: &Path,
    copy_back: Option<&Path>,
    marker: &str,
) -> Result<(), StagingError> {
    match fs::remove_file(working.join(marker)) {
        Ok(()) => {}
        Err(remove_error) if remove_error.kind() == io::ErrorKind::NotFound => {}
        Err(remove_error) => return Err(remove_error.into()),
    }

    if let Some(copy_back_dir) = copy_back {
        copy_tree(working, copy_back_dir).map_err(|staging_error| {
            error!(working = ?working, copy_back = ?copy_back_dir, "failed to copy outputs back");
            staging_error
        })?;

        debug!(copy_back = ?copy_back_dir, "copied outputs back");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_row_renders_bare() {
        assert_eq!(compact_range(&[5]), "5");
    }

    #[test]
    fn disjoint_singletons_are_underscore_joined() {
        assert_eq!(compact_range(&[2, 8]), "2_8");
    }

    #[test]
    fn consecutive_runs_collapse() {
        assert_eq!(compact_range(&[0, 1, 2, 3, 4, 7, 8]), "0-4_7-8");
    }

    #[test]
    fn runs_and_singletons_mix() {
        assert_eq!(compact_range(&[2, 3, 4, 6, 8, 9, 11, 14]), "2-4_6_8-9_11_14");
    }

    #[test]
    fn empty_input_renders_empty() {
        assert_eq!(compact_range(&[]), "");
    }

    #[test]
    fn task_dir_names_embed_the_range() {
        assert_eq!(task_dir_name("sim", 3, &[4, 5, 6]), "sim4-6_worker3");
    }

    #[test]
    fn staging_copies_files_before_the_marker() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("input");
        let calc = root.path().join("calc");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("file"), b"payload").unwrap();

        stage_input(&input, &calc, DEFAULT_STAGE_MARKER).unwrap();

        assert!(calc.join("file").is_file());
        assert!(calc.join(DEFAULT_STAGE_MARKER).is_file());
    }

    #[test]
    fn unstaging_removes_the_marker_and_copies_back() {
        let root = tempfile::tempdir().unwrap();
        let calc = root.path().join("calc");
        let back = root.path().join("calc_back");
        fs::create_dir_all(&calc).unwrap();
        fs::write(calc.join("file"), b"result").unwrap();
        fs::File::create(calc.join(DEFAULT_STAGE_MARKER)).unwrap();

        unstage_output(&calc, Some(&back), DEFAULT_STAGE_MARKER).unwrap();

        assert!(!calc.join(DEFAULT_STAGE_MARKER).exists());
        assert!(back.join("file").is_file());
        assert!(!back.join(DEFAULT_STAGE_MARKER).exists());
    }

    #[test]
    fn unstaging_twice_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let calc = root.path().join("calc");
        fs::create_dir_all(&calc).unwrap();
        fs::File::create(calc.join(DEFAULT_STAGE_MARKER)).unwrap();

        unstage_output(&calc, None, DEFAULT_STAGE_MARKER).unwrap();
        unstage_output(&calc, None, DEFAULT_STAGE_MARKER).unwrap();
    }
}
