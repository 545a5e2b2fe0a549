// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Splitting long-running units into equal-duration pieces.
//!
//! A unit whose recorded duration exceeds the [`SplitThreshold`] is split into
//! `ceil(duration / threshold)` pieces, each carrying an equal share of the duration. The test
//! runner is expected to run piece `i/k` by selecting the `i`th of `k` slices of the unit's tests.

use crate::{errors::SplitThresholdError, unit::UnitName};
use serde::Deserialize;
use std::{fmt, time::Duration};
use tracing::warn;

/// The duration above which a unit is split into multiple pieces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SplitThreshold(Duration);

impl SplitThreshold {
    /// The default threshold: 10 minutes.
    pub const DEFAULT: Self = Self(Duration::from_secs(10 * 60));

    /// The smallest threshold accepted: 1 second.
    pub const MIN: Duration = Duration::from_secs(1);

    /// Creates a new threshold, returning an error if `threshold` is less than [`Self::MIN`].
    pub fn new(threshold: Duration) -> Result<Self, SplitThresholdError> {
        if threshold < Self::MIN {
            Err(SplitThresholdError { threshold })
        } else {
            Ok(Self(threshold))
        }
    }

    /// Returns the threshold as a duration.
    pub fn get(self) -> Duration {
        self.0
    }
}

impl Default for SplitThreshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl<'de> Deserialize<'de> for SplitThreshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let duration = humantime_serde::deserialize(deserializer)?;
        Self::new(duration).map_err(serde::de::Error::custom)
    }
}

/// One piece of a test unit, as placed into a shard.
///
/// Pieces are never mutated after they're created.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ScheduledPiece {
    name: UnitName,
    piece: u32,
    total_pieces: u32,
    duration: Option<Duration>,
}

impl ScheduledPiece {
    /// Creates a piece for a unit that wasn't split.
    pub fn whole(name: UnitName, duration: Duration) -> Self {
        Self {
            name,
            piece: 1,
            total_pieces: 1,
            duration: Some(duration),
        }
    }

    /// Creates the single piece for a unit with no recorded duration.
    pub fn unknown(name: UnitName) -> Self {
        Self {
            name,
            piece: 1,
            total_pieces: 1,
            duration: None,
        }
    }

    /// Returns the name of the unit this piece belongs to.
    pub fn name(&self) -> &UnitName {
        &self.name
    }

    /// Returns the index of this piece, counting up from 1.
    pub fn piece(&self) -> u32 {
        self.piece
    }

    /// Returns the number of pieces the unit was split into.
    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// Returns true if the unit was split into more than one piece.
    pub fn is_split(&self) -> bool {
        self.total_pieces > 1
    }

    /// Returns the expected duration of this piece, or `None` if the unit's cost is unknown.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Returns true if the unit's cost is unknown.
    pub fn is_unknown(&self) -> bool {
        self.duration.is_none()
    }

    /// Returns the time this piece contributes to a shard's projected time.
    ///
    /// Unknown-cost pieces contribute nothing.
    pub fn time(&self) -> Duration {
        self.duration.unwrap_or_default()
    }
}

impl fmt::Display for ScheduledPiece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.name, self.piece, self.total_pieces)
    }
}

/// The most pieces a single unit is ever split into.
///
/// Durations loaded through [`DurationTable`](crate::durations::DurationTable) together with
/// [`SplitThreshold::MIN`] stay below this.
pub const MAX_PIECES: u32 = 100_000;

/// Splits a unit into pieces according to `threshold`.
///
/// Units with an unknown duration are never split. A unit that would need more than
/// [`MAX_PIECES`] pieces is split into exactly that many, each longer than the threshold.
pub fn split_unit(
    name: &UnitName,
    duration: Option<Duration>,
    threshold: SplitThreshold,
) -> Vec<ScheduledPiece> {
    let duration = match duration {
        Some(duration) => duration,
        None => return vec![ScheduledPiece::unknown(name.clone())],
    };

    if duration <= threshold.get() {
        return vec![ScheduledPiece::whole(name.clone(), duration)];
    }

    // Computed on whole nanoseconds so that exact multiples of the threshold don't pick up an
    // extra piece from floating-point rounding.
    let total_pieces = duration.as_nanos().div_ceil(threshold.get().as_nanos());
    let total_pieces = match u32::try_from(total_pieces) {
        Ok(total_pieces) if total_pieces <= MAX_PIECES => total_pieces,
        _ => {
            warn!(
                "{name} would be split into {total_pieces} pieces, using {MAX_PIECES} instead \
                 (duration {duration:?}, threshold {:?})",
                threshold.get(),
            );
            MAX_PIECES
        }
    };
    let share = duration / total_pieces;

    (1..=total_pieces)
        .map(|piece| ScheduledPiece {
            name: name.clone(),
            piece,
            total_pieces,
            duration: Some(share),
        })
        .collect()
}
