// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Root element for a serializable run plan.
///
/// Durations are expressed in floating-point seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunPlanSummary {
    /// The number of parallel slots each shard was simulated with.
    pub parallel_width: usize,

    /// The split threshold, in seconds.
    pub split_threshold_secs: f64,

    /// Whether pieces within each shard were reordered by the prioritizer.
    pub prioritized: bool,

    /// The shards in the plan, ordered by index.
    ///
    /// If a single shard was selected, only that shard is present.
    pub shards: Vec<ShardSummary>,
}

impl RunPlanSummary {
    /// Parses a summary from the JSON produced by `shardplan plan --message-format json`.
    pub fn parse_json(json: impl AsRef<str>) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.as_ref())
    }
}

/// A single shard within a [`RunPlanSummary`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShardSummary {
    /// The shard number, counting up from 1.
    pub shard: usize,

    /// The projected wall-clock time for this shard, in seconds.
    pub projected_secs: f64,

    /// The ordered list of pieces to run on this shard.
    pub pieces: Vec<PieceSummary>,
}

/// A single piece of a test unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PieceSummary {
    /// The name of the unit this piece belongs to.
    pub unit: SmolStr,

    /// The piece index, counting up from 1.
    pub piece: u32,

    /// The total number of pieces the unit was split into.
    pub total_pieces: u32,

    /// The expected duration of this piece in seconds, or `None` if the unit had no recorded
    /// duration.
    pub duration_secs: Option<f64>,

    /// True if the piece must run serially.
    pub serial: bool,

    /// True if the piece was moved to the front by the prioritizer.
    #[serde(default)]
    pub prioritized: bool,
}
