// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by shardplan.

use camino::{Utf8Path, Utf8PathBuf};
use config::ConfigError;
use std::{borrow::Cow, fmt, num::ParseIntError, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse shardplan config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A serial pattern failed to compile.
    #[error("invalid serial pattern in profile `{profile}`")]
    SerialPattern {
        /// The profile the pattern was defined in.
        profile: String,

        /// The underlying error.
        #[source]
        err: SerialPatternError,
    },
}

/// An error which indicates that a profile was requested but not known to shardplan.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// A glob pattern used to classify serial units failed to compile.
#[derive(Debug, Error)]
#[error("failed to compile serial pattern `{pattern}`")]
pub struct SerialPatternError {
    pattern: String,
    #[source]
    err: globset::Error,
}

impl SerialPatternError {
    pub(crate) fn new(pattern: impl Into<String>, err: globset::Error) -> Self {
        Self {
            pattern: pattern.into(),
            err,
        }
    }

    /// Returns the pattern that failed to compile.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// An invalid number of shards was requested.
///
/// This is a fatal configuration error: a plan always has at least one shard.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ShardCountError {
    /// The shard count was zero.
    #[error("shard count must be at least 1")]
    Zero,

    /// The shard count could not be parsed as an integer.
    #[error("failed to parse shard count `{input}`")]
    Parse {
        /// The input that failed to parse.
        input: String,

        /// The underlying error.
        #[source]
        err: ParseIntError,
    },
}

/// An error that occurs while parsing a [`ShardSelection`](crate::partition::ShardSelection)
/// input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSelectionParseError {
    expected_format: Option<&'static str>,
    message: Cow<'static, str>,
}

impl ShardSelectionParseError {
    pub(crate) fn new(
        expected_format: Option<&'static str>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            expected_format,
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardSelectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.expected_format {
            Some(format) => {
                write!(
                    f,
                    "shard selection must be in the format \"{}\":\n{}",
                    format, self.message
                )
            }
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ShardSelectionParseError {}

/// A shard selection doesn't fit the run plan it was applied to.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("shard selection {shard}/{total_shards} doesn't match a plan with {plan_shards} shards")]
pub struct ShardSelectionMismatch {
    /// The selected shard, counting up from 1.
    pub shard: usize,

    /// The total number of shards in the selection.
    pub total_shards: usize,

    /// The number of shards in the plan.
    pub plan_shards: usize,
}

/// An error that occurs while parsing a parallel width value from a string or from config.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unrecognized value for parallel-width: {input}\n(expected \"auto\" or a positive integer)")]
pub struct ParallelWidthParseError {
    input: String,
}

impl ParallelWidthParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// A split threshold below [`SplitThreshold::MIN`](crate::split::SplitThreshold::MIN) was
/// provided.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("split threshold must be at least 1s (found {threshold:?})")]
pub struct SplitThresholdError {
    /// The threshold that was rejected.
    pub threshold: Duration,
}

/// An error that occurred while loading a durations table.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DurationTableError {
    /// Error reading the durations file.
    #[error("failed to read durations table at `{path}`")]
    Read {
        /// The path that failed to be read.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        err: std::io::Error,
    },

    /// Error deserializing the durations file.
    #[error("failed to parse durations table at `{path}`")]
    Parse {
        /// The path that failed to be parsed.
        path: Utf8PathBuf,

        /// The underlying deserialization error.
        #[source]
        err: serde_json::Error,
    },

    /// A duration was negative, not finite, or longer than
    /// [`DurationTable::MAX_DURATION`](crate::durations::DurationTable::MAX_DURATION).
    #[error("invalid duration {value} for unit `{unit}` in `{path}`")]
    InvalidDuration {
        /// The path the duration was read from.
        path: Utf8PathBuf,

        /// The unit with the invalid duration.
        unit: String,

        /// The invalid value, in seconds.
        value: f64,
    },
}

/// An error returned by the change or failure oracles.
///
/// Oracle errors never abort a scheduling run: they're turned into warnings, and the affected
/// source contributes no interesting units.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OracleError {
    /// Executing git failed.
    #[error("failed to execute `{command}`")]
    GitExec {
        /// The command that was run.
        command: String,

        /// The underlying IO error.
        #[source]
        err: std::io::Error,
    },

    /// Git exited with a non-zero status.
    #[error("`{command}` failed with {status}:\n{stderr}")]
    GitFailed {
        /// The command that was run.
        command: String,

        /// The exit status, formatted for display.
        status: String,

        /// Standard error produced by git.
        stderr: String,
    },

    /// Git produced output that isn't valid UTF-8.
    #[error("`{command}` produced non-UTF-8 output")]
    GitOutputNotUtf8 {
        /// The command that was run.
        command: String,
    },

    /// Error reading the last-failed cache.
    #[error("failed to read last-failed cache at `{path}`")]
    CacheRead {
        /// The path that failed to be read.
        path: Utf8PathBuf,

        /// The underlying IO error.
        #[source]
        err: std::io::Error,
    },

    /// Error deserializing the last-failed cache.
    #[error("failed to parse last-failed cache at `{path}`")]
    CacheParse {
        /// The path that failed to be parsed.
        path: Utf8PathBuf,

        /// The underlying deserialization error.
        #[source]
        err: serde_json::Error,
    },
}

/// An error that occurs while writing a run plan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WritePlanError {
    /// An error occurred while writing the plan to the provided output.
    #[error("error writing to output")]
    Io(#[source] std::io::Error),

    /// An error occurred while serializing JSON, or while writing it to the provided output.
    #[error("error serializing to JSON")]
    Json(#[source] serde_json::Error),
}

/// An error returned by an accelerator probe while discovering the parallel width.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WidthProbeError {
    /// Executing the probe command failed.
    #[error("failed to execute `{command}`")]
    Exec {
        /// The command that was run.
        command: String,

        /// The underlying IO error.
        #[source]
        err: std::io::Error,
    },

    /// The probe command exited with a non-zero status.
    #[error("`{command}` failed with {status}")]
    Failed {
        /// The command that was run.
        command: String,

        /// The exit status, formatted for display.
        status: String,
    },

    /// The probe ran, but reported no usable devices.
    #[error("`{command}` reported no devices")]
    NoDevices {
        /// The command that was run.
        command: String,
    },
}
