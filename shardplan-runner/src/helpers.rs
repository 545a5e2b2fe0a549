// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for shardplan-runner.

use std::{fmt, time::Duration};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "piece" if `count` is 1, otherwise "pieces".
    pub fn pieces_str(count: usize) -> &'static str {
        if count == 1 { "piece" } else { "pieces" }
    }

    /// Returns "shard" if `count` is 1, otherwise "shards".
    pub fn shards_str(count: usize) -> &'static str {
        if count == 1 { "shard" } else { "shards" }
    }

    /// Returns "unit" if `count` is 1, otherwise "units".
    pub fn units_str(count: usize) -> &'static str {
        if count == 1 { "unit" } else { "units" }
    }
}

/// Displays a duration as a short, approximate estimate: `0s`, `12.5s`, `3.2m` or `1.1h`.
#[derive(Clone, Copy, Debug)]
pub struct DisplayEstimate(pub Duration);

impl fmt::Display for DisplayEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs_f64();
        if secs < 0.00001 {
            write!(f, "0s")
        } else if secs < 60.0 {
            write!(f, "{secs:.1}s")
        } else if secs < 3600.0 {
            write!(f, "{:.1}m", secs / 60.0)
        } else {
            write!(f, "{:.1}h", secs / 3600.0)
        }
    }
}

/// Displays a duration in seconds with three decimal places, right-aligned in brackets.
#[derive(Clone, Copy, Debug)]
pub struct DisplayBracketedDuration(pub Duration);

impl fmt::Display for DisplayBracketedDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // * > means right-align.
        // * 10 is the number of characters to pad to.
        // * .3 means print three digits after the decimal point.
        write!(f, "[{:>10.3}s]", self.0.as_secs_f64())
    }
}
