// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sources of "interesting" units: ones touched by the pending change, and ones that failed in
//! the previous run.
//!
//! Both sources are advisory. An oracle that can't answer never stops a run: the error is logged
//! and the oracle contributes nothing.

mod git;
mod last_failed;

pub use git::*;
pub use last_failed::*;

use crate::{errors::OracleError, prioritize::InterestingUnits, unit::UnitName};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Reports units touched by the pending change.
pub trait ChangedUnits {
    /// Returns the changed units.
    fn changed_units(&self) -> Result<BTreeSet<UnitName>, OracleError>;
}

/// Reports units that failed in the previous run.
pub trait FailedUnits {
    /// Returns the previously failed units.
    fn failed_units(&self) -> Result<BTreeSet<UnitName>, OracleError>;
}

impl<T: ChangedUnits + ?Sized> ChangedUnits for &T {
    fn changed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
        (**self).changed_units()
    }
}

impl<T: FailedUnits + ?Sized> FailedUnits for &T {
    fn failed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
        (**self).failed_units()
    }
}

/// A fixed set of units, usable as either kind of oracle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnitSnapshot(pub BTreeSet<UnitName>);

impl ChangedUnits for UnitSnapshot {
    fn changed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
        Ok(self.0.clone())
    }
}

impl FailedUnits for UnitSnapshot {
    fn failed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
        Ok(self.0.clone())
    }
}

impl<N: Into<UnitName>> FromIterator<N> for UnitSnapshot {
    fn from_iter<I: IntoIterator<Item = N>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Maps repository-relative file paths to unit names.
///
/// A path names a unit if it starts with `prefix` and ends with `suffix`; the unit name is what
/// remains once both are stripped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnitPathMapping {
    prefix: String,
    suffix: String,
}

impl UnitPathMapping {
    /// The default prefix.
    pub const DEFAULT_PREFIX: &'static str = "test/";

    /// The default suffix.
    pub const DEFAULT_SUFFIX: &'static str = ".py";

    /// Creates a new mapping.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Returns the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the suffix.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Returns the unit named by `path`, if any.
    pub fn unit_for_path(&self, path: &str) -> Option<UnitName> {
        let name = path
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        (!name.is_empty()).then(|| UnitName::new(name))
    }

    /// Maps every path in `paths`, dropping those that don't name a unit.
    pub fn units_for_paths<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<UnitName> {
        paths
            .into_iter()
            .filter_map(|path| self.unit_for_path(path))
            .collect()
    }
}

impl Default for UnitPathMapping {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX, Self::DEFAULT_SUFFIX)
    }
}

/// Queries both oracles and combines their answers.
///
/// Oracle errors are logged as warnings and treated as empty answers.
pub fn collect_interesting(failed: &dyn FailedUnits, changed: &dyn ChangedUnits) -> InterestingUnits {
    let previously_failed = failed.failed_units().unwrap_or_else(|err| {
        warn!("can't determine previously failed tests, skipping: {err}");
        BTreeSet::new()
    });
    let changed = changed.changed_units().unwrap_or_else(|err| {
        warn!("can't determine changed tests, skipping: {err}");
        BTreeSet::new()
    });

    if !previously_failed.is_empty() {
        info!(
            "prioritizing previously failed tests: {}",
            DisplayUnitList(&previously_failed)
        );
    }
    if !changed.is_empty() {
        info!("prioritizing changed tests: {}", DisplayUnitList(&changed));
    }

    InterestingUnits::new(previously_failed, changed)
}

struct DisplayUnitList<'a>(&'a BTreeSet<UnitName>);

impl std::fmt::Display for DisplayUnitList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, unit) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{unit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("test/test_nn.py", Some("test_nn"); "plain")]
    #[test_case("test/distributed/test_c10d.py", Some("distributed/test_c10d"); "nested")]
    #[test_case("torch/nn/functional.py", None; "wrong prefix")]
    #[test_case("test/README.md", None; "wrong suffix")]
    #[test_case("test/.py", None; "empty name")]
    #[test_case("atest/test_nn.py", None; "prefix must be at start")]
    fn unit_for_path(path: &str, expected: Option<&str>) {
        let mapping = UnitPathMapping::default();
        assert_eq!(mapping.unit_for_path(path), expected.map(UnitName::new));
    }

    #[test]
    fn custom_mapping() {
        let mapping = UnitPathMapping::new("tests/", "_test.rs");
        let units = mapping.units_for_paths(["tests/parser_test.rs", "src/lib.rs", "tests/mod.rs"]);
        assert_eq!(units, [UnitName::new("parser")].into_iter().collect());
    }

    struct Broken;

    impl ChangedUnits for Broken {
        fn changed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
            Err(OracleError::GitOutputNotUtf8 {
                command: "git diff --name-only HEAD^ HEAD".to_owned(),
            })
        }
    }

    impl FailedUnits for Broken {
        fn failed_units(&self) -> Result<BTreeSet<UnitName>, OracleError> {
            Err(OracleError::CacheRead {
                path: Utf8PathBuf::from("lastfailed"),
                err: std::io::Error::other("permission denied"),
            })
        }
    }

    #[test]
    fn collect_combines_sources() {
        let failed: UnitSnapshot = ["test_a"].into_iter().collect();
        let changed: UnitSnapshot = ["test_b", "test_a"].into_iter().collect();
        let interesting = collect_interesting(&failed, &changed);

        assert_eq!(interesting.previously_failed(), &failed.0);
        assert_eq!(interesting.changed(), &changed.0);
        assert_eq!(
            interesting.union().into_iter().map(UnitName::as_str).collect::<Vec<_>>(),
            ["test_a", "test_b"]
        );
    }

    #[test]
    fn oracle_errors_degrade_to_empty() {
        let changed: UnitSnapshot = ["test_b"].into_iter().collect();
        let interesting = collect_interesting(&Broken, &changed);
        assert!(interesting.previously_failed().is_empty());
        assert!(interesting.contains("test_b"));

        let interesting = collect_interesting(&Broken, &Broken);
        assert!(interesting.is_empty());
    }
}
