// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Historical durations for test units.
//!
//! The [`DurationModel`] trait is the scheduler's only view of cost. [`DurationTable`] is the
//! default implementation, backed by a flat JSON object mapping unit names to seconds:
//!
//! ```json
//! { "test_autograd": 1843.2, "test_nn": 2412.9, "test_torch": 412.0 }
//! ```

use crate::{errors::DurationTableError, unit::UnitName};
use camino::Utf8Path;
use indexmap::IndexMap;
use std::{collections::BTreeMap, fs, time::Duration};
use tracing::debug;

/// Maps a test unit to its expected run duration.
///
/// Returning `None` means the unit's cost is unknown. A model is read-only for the length of a
/// scheduling run, and may be shared across runs.
pub trait DurationModel {
    /// Returns the expected duration of `unit`, if known.
    fn duration_of(&self, unit: &str) -> Option<Duration>;
}

impl<T: DurationModel + ?Sized> DurationModel for &T {
    fn duration_of(&self, unit: &str) -> Option<Duration> {
        (**self).duration_of(unit)
    }
}

impl DurationModel for BTreeMap<UnitName, Duration> {
    fn duration_of(&self, unit: &str) -> Option<Duration> {
        self.get(unit).copied()
    }
}

impl DurationModel for IndexMap<UnitName, Duration> {
    fn duration_of(&self, unit: &str) -> Option<Duration> {
        self.get(unit).copied()
    }
}

/// A table of historical durations, in the order they were recorded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DurationTable {
    times: IndexMap<UnitName, Duration>,
}

impl DurationTable {
    /// Loads a durations table from a JSON file.
    pub fn load(path: &Utf8Path) -> Result<Self, DurationTableError> {
        let contents = fs::read_to_string(path).map_err(|err| DurationTableError::Read {
            path: path.to_owned(),
            err,
        })?;
        let table = Self::from_json_str(path, &contents)?;
        debug!("loaded {} durations from `{path}`", table.len());
        Ok(table)
    }

    /// The longest duration a table may record for a unit: one day.
    pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Parses a durations table from JSON. `path` is used for error reporting.
    ///
    /// Each value must be a number of seconds between zero and [`Self::MAX_DURATION`].
    pub fn from_json_str(path: &Utf8Path, contents: &str) -> Result<Self, DurationTableError> {
        let raw: IndexMap<UnitName, f64> =
            serde_json::from_str(contents).map_err(|err| DurationTableError::Parse {
                path: path.to_owned(),
                err,
            })?;

        let times = raw
            .into_iter()
            .map(|(unit, secs)| match Duration::try_from_secs_f64(secs) {
                Ok(duration) if duration <= Self::MAX_DURATION => Ok((unit, duration)),
                _ => Err(DurationTableError::InvalidDuration {
                    path: path.to_owned(),
                    unit: unit.as_str().to_owned(),
                    value: secs,
                }),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { times })
    }

    /// Builds a table from unit names and durations in seconds.
    ///
    /// # Panics
    ///
    /// Panics if a duration is negative or not finite.
    pub fn from_secs<I, N>(iter: I) -> Self
    where
        I: IntoIterator<Item = (N, f64)>,
        N: Into<UnitName>,
    {
        iter.into_iter()
            .map(|(name, secs)| (name.into(), Duration::from_secs_f64(secs)))
            .collect()
    }

    /// Returns the units in this table, in the order they were recorded.
    pub fn units(&self) -> impl ExactSizeIterator<Item = &UnitName> + '_ {
        self.times.keys()
    }

    /// Returns the number of units in this table.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

impl DurationModel for DurationTable {
    fn duration_of(&self, unit: &str) -> Option<Duration> {
        self.times.get(unit).copied()
    }
}

impl FromIterator<(UnitName, Duration)> for DurationTable {
    fn from_iter<T: IntoIterator<Item = (UnitName, Duration)>>(iter: T) -> Self {
        Self {
            times: iter.into_iter().collect(),
        }
    }
}
