// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{FailedUnits, UnitPathMapping};
use crate::{errors::OracleError, unit::UnitName};
use camino::{Utf8Path, Utf8PathBuf};
use serde::de::IgnoredAny;
use std::{collections::BTreeMap, collections::BTreeSet, fs};
use tracing::{debug, warn};

/// Reads failures from the previous run out of a test runner's last-failed cache.
///
/// The cache is a JSON object keyed by node IDs such as
/// `test/test_nn.py::TestNN::test_conv[cuda]`. The part before the first separator is the file
/// containing the test, which is then mapped to a unit name. Values are ignored.
#[derive(Clone, Debug)]
pub struct LastFailedCache {
    path: Utf8PathBuf,
    separator: String,
    mapping: UnitPathMapping,
}

impl LastFailedCache {
    /// The default location of the cache, relative to the workspace root.
    pub const DEFAULT_PATH: &'static str = ".pytest_cache/v/cache/lastfailed";

    /// The default separator between components of a node ID.
    pub const DEFAULT_SEPARATOR: &'static str = "::";

    /// Creates a new cache reader for the file at `path`.
    pub fn new(path: impl Into<Utf8PathBuf>, mapping: UnitPathMapping) -> Self {
        Self {
            path: path.into(),
            separator: Self::DEFAULT_SEPARATOR.to_owned(),
            mapping,
        }
    }

    /// Sets the node ID separator.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Returns the path to the cache file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the files containing failed tests.
    ///
    /// Returns `Ok(None)` if the cache doesn't exist.
    pub fn load(&self) -> Result<Option<BTreeSet<String>>, OracleError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(OracleError::CacheRead {
                    path: self.path.clone(),
                    err,
                });
            }
        };

        let entries: BTreeMap<String, IgnoredAny> =
            serde_json::from_str(&contents).map_err(|err| OracleError::CacheParse {
                path: self.path.clone(),
                err,
            })?;
        debug!("loaded {} entries from {}", entries.len(), self.path);

        Ok(Some(
            entries
                .keys()
                .filter_map(|node_id| node_id.split_once(self.separator.as_str()))
                .map(|(file, _)| file.to_owned())
                .collect(),
        ))
    }
}

impl FailedUnits for LastFailedCache {
    fn failed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
        match self.load()? {
            Some(files) => Ok(self.mapping.units_for_paths(files.iter().map(String::as_str))),
            None => {
                warn!("no last-failed cache found at {}", self.path);
                Ok(BTreeSet::new())
            }
        }
    }
}
