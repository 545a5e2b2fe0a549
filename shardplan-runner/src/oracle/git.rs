// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ChangedUnits, UnitPathMapping};
use crate::{errors::OracleError, unit::UnitName};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Finds changed units by diffing `HEAD` against its merge base with the default branch.
///
/// When `HEAD` is already on the default branch, the diff covers just the last commit.
#[derive(Clone, Debug)]
pub struct GitChangedFiles {
    repo_dir: Utf8PathBuf,
    default_branch: String,
    mapping: UnitPathMapping,
}

impl GitChangedFiles {
    /// The default branch used if none is configured.
    pub const DEFAULT_BRANCH: &'static str = "main";

    /// Creates a new oracle for the repository at `repo_dir`.
    pub fn new(repo_dir: impl Into<Utf8PathBuf>, mapping: UnitPathMapping) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            default_branch: Self::DEFAULT_BRANCH.to_owned(),
            mapping,
        }
    }

    /// Sets the default branch, as it's named on `origin`.
    pub fn with_default_branch(mut self, default_branch: impl Into<String>) -> Self {
        self.default_branch = default_branch.into();
        self
    }

    /// Returns the repository directory.
    pub fn repo_dir(&self) -> &Utf8Path {
        &self.repo_dir
    }

    /// Returns the default branch.
    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Returns the paths changed relative to the base commit.
    pub fn changed_files(&self) -> Result<Vec<String>, OracleError> {
        let upstream = format!("origin/{}", self.default_branch);
        let merge_base = self.git(&["merge-base", &upstream, "HEAD"])?;
        let head = self.git(&["rev-parse", "HEAD"])?;

        let base = base_commit(merge_base.trim(), head.trim());
        debug!("diffing against base commit {base}");

        let diff = self.git(&["diff", "--name-only", base, "HEAD"])?;
        Ok(parse_name_only(&diff))
    }

    fn git(&self, args: &[&str]) -> Result<String, OracleError> {
        let command = format!("git {}", args.join(" "));
        let expression = duct::cmd("git", args.iter().copied()).dir(self.repo_dir.as_std_path());
        trace!("Executing command: {:?}", expression);

        let output = expression
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|err| OracleError::GitExec {
                command: command.clone(),
                err,
            })?;
        if !output.status.success() {
            return Err(OracleError::GitFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            });
        }

        String::from_utf8(output.stdout).map_err(|_| OracleError::GitOutputNotUtf8 { command })
    }
}

impl ChangedUnits for GitChangedFiles {
    fn changed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
        let files = self.changed_files()?;
        Ok(self.mapping.units_for_paths(files.iter().map(String::as_str)))
    }
}

fn base_commit<'a>(merge_base: &'a str, head: &str) -> &'a str {
    if merge_base == head {
        // On the default branch itself: look at the last commit.
        "HEAD^"
    } else {
        merge_base
    }
}

fn parse_name_only(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
