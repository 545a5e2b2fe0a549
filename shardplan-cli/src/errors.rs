// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::{FromPathBufError, Utf8PathBuf};
use owo_colors::OwoColorize;
use shardplan_metadata::ShardplanExitCode;
use shardplan_runner::errors::*;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholder messages. Errors are printed with display_to_stderr, which
// colorizes them.

/// An error that shardplan expects could happen, with a dedicated exit code.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 {
        #[source]
        err: FromPathBufError,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("durations table error")]
    DurationTableError {
        #[from]
        err: DurationTableError,
    },
    #[error("units file read error")]
    UnitsFileReadError {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("shard selection mismatch")]
    ShardSelectionMismatch {
        #[from]
        err: ShardSelectionMismatch,
    },
    #[error("error writing plan")]
    WritePlanError {
        #[from]
        err: WritePlanError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn units_file_read_error(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Self::UnitsFileReadError {
            path: path.into(),
            err,
        }
    }

    pub(crate) fn write_output_error(err: std::io::Error) -> Self {
        Self::WriteOutputError { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::ProfileNotFound { .. }
            | Self::DurationTableError { .. }
            | Self::UnitsFileReadError { .. }
            | Self::ShardSelectionMismatch { .. } => ShardplanExitCode::SETUP_ERROR,
            Self::WritePlanError { .. } | Self::WriteOutputError { .. } => {
                ShardplanExitCode::WRITE_OUTPUT_ERROR
            }
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::CurrentDirFailed { err } => {
                error!("could not determine current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { err } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    err.as_path().display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse shardplan config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::ProfileNotFound { err } => {
                error!("{err}");
                err.source()
            }
            Self::DurationTableError { err } => {
                error!("{err}");
                err.source()
            }
            Self::UnitsFileReadError { path, err } => {
                error!(
                    "failed to read units from `{}`",
                    path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::ShardSelectionMismatch { err } => {
                error!("{err}");
                None
            }
            Self::WritePlanError { err } => {
                error!("failed to write plan to output");
                Some(err as &dyn Error)
            }
            Self::WriteOutputError { err } => {
                error!("failed to write to output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
