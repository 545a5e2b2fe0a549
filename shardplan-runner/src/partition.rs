// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partitioning test units across shards.
//!
//! [`ShardBalancer`] is a greedy scheduler. Units with a recorded duration are split into pieces,
//! the pieces are sorted longest-first, and each piece is placed on whichever shard currently has
//! the lowest projected time (see [`CapacitySimulator`](crate::capacity::CapacitySimulator)).
//! Units with no recorded duration are then dealt out round-robin, starting from the least-loaded
//! shard.

use crate::{
    capacity::{CapacitySimulator, LaneSimulation},
    durations::DurationModel,
    errors::{
        SerialPatternError, ShardCountError, ShardSelectionMismatch, ShardSelectionParseError,
    },
    split::{ScheduledPiece, SplitThreshold, split_unit},
    unit::UnitName,
    width::ParallelWidth,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::{fmt, num::NonZeroUsize, str::FromStr, time::Duration};
use tracing::{debug, trace};

/// The number of shards to partition a run into.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ShardCount(NonZeroUsize);

impl ShardCount {
    /// Creates a new shard count, returning an error if `count` is zero.
    pub fn new(count: usize) -> Result<Self, ShardCountError> {
        NonZeroUsize::new(count)
            .map(Self)
            .ok_or(ShardCountError::Zero)
    }

    /// Returns the shard count as a `usize`.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl FromStr for ShardCount {
    type Err = ShardCountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let count: usize = s.parse().map_err(|err| ShardCountError::Parse {
            input: s.to_owned(),
            err,
        })?;
        Self::new(count)
    }
}

impl fmt::Display for ShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single shard selected out of a plan, in the format `M/N`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShardSelection {
    shard: usize,
    total_shards: ShardCount,
}

impl ShardSelection {
    /// Returns the selected shard, counting up from 1.
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Returns the total number of shards.
    pub fn total_shards(&self) -> ShardCount {
        self.total_shards
    }

    /// Returns the selected shard of `plan`.
    pub fn select<'a>(&self, plan: &'a RunPlan) -> Result<&'a PlannedShard, ShardSelectionMismatch> {
        if plan.shards.len() != self.total_shards.get() {
            return Err(ShardSelectionMismatch {
                shard: self.shard,
                total_shards: self.total_shards.get(),
                plan_shards: plan.shards.len(),
            });
        }
        Ok(&plan.shards[self.shard - 1])
    }
}

impl FromStr for ShardSelection {
    type Err = ShardSelectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (shard, total_shards) = parse_shards(s, "M/N")?;
        Ok(Self {
            shard,
            total_shards,
        })
    }
}

impl fmt::Display for ShardSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shard, self.total_shards)
    }
}

fn parse_shards(
    input: &str,
    expected_format: &'static str,
) -> Result<(usize, ShardCount), ShardSelectionParseError> {
    let (shard_str, total_shards_str) = input.split_once('/').ok_or_else(|| {
        ShardSelectionParseError::new(
            Some(expected_format),
            format!("expected input '{input}' to be in the format M/N"),
        )
    })?;

    let shard: usize = shard_str.parse().map_err(|err| {
        ShardSelectionParseError::new(
            Some(expected_format),
            format!("failed to parse shard '{shard_str}' as an integer: {err}"),
        )
    })?;

    let total_shards: usize = total_shards_str.parse().map_err(|err| {
        ShardSelectionParseError::new(
            Some(expected_format),
            format!("failed to parse total shards '{total_shards_str}' as an integer: {err}"),
        )
    })?;

    // Check that shard > 0 and <= total_shards.
    if !(1..=total_shards).contains(&shard) {
        return Err(ShardSelectionParseError::new(
            Some(expected_format),
            format!(
                "shard {shard} must be a number between 1 and total shards {total_shards}, inclusive"
            ),
        ));
    }

    let total_shards = ShardCount::new(total_shards)
        .map_err(|err| ShardSelectionParseError::new(Some(expected_format), err.to_string()))?;

    Ok((shard, total_shards))
}

/// Classifies units as must-run-serially or parallel-eligible.
pub trait MustSerial {
    /// Returns true if `unit` must run serially.
    fn is_serial(&self, unit: &str) -> bool;
}

impl<F> MustSerial for F
where
    F: Fn(&str) -> bool,
{
    fn is_serial(&self, unit: &str) -> bool {
        self(unit)
    }
}

/// A [`MustSerial`] implementation driven by configuration.
#[derive(Clone, Debug, Default)]
pub enum SerialPolicy {
    /// Every unit runs serially. This is the default when no policy is given.
    #[default]
    All,

    /// Every unit may run in parallel.
    None,

    /// Units matching any of these patterns run serially; all others may run in parallel.
    Patterns(GlobSet),
}

impl SerialPolicy {
    /// Builds a policy from a list of glob patterns.
    ///
    /// If `patterns` is empty, `default_serial` picks between [`SerialPolicy::All`] and
    /// [`SerialPolicy::None`].
    pub fn from_patterns<I, S>(patterns: I, default_serial: bool) -> Result<Self, SerialPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut any = false;
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|err| SerialPatternError::new(pattern, err))?;
            builder.add(glob);
            any = true;
        }

        if !any {
            return Ok(if default_serial { Self::All } else { Self::None });
        }

        let set = builder
            .build()
            .map_err(|err| SerialPatternError::new("<set>", err))?;
        Ok(Self::Patterns(set))
    }
}

impl MustSerial for SerialPolicy {
    fn is_serial(&self, unit: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Patterns(set) => set.is_match(unit),
        }
    }
}

/// One shard's worth of work while a plan is being built.
#[derive(Clone, Debug)]
pub struct ShardBucket {
    serial: Vec<ScheduledPiece>,
    parallel: Vec<ScheduledPiece>,
    lanes: LaneSimulation,
}

impl ShardBucket {
    fn new(simulator: &CapacitySimulator) -> Self {
        Self {
            serial: Vec::new(),
            parallel: Vec::new(),
            lanes: simulator.empty(),
        }
    }

    fn push_serial(&mut self, piece: ScheduledPiece) {
        self.lanes.add_serial(piece.time());
        self.serial.push(piece);
    }

    fn push_parallel(&mut self, piece: ScheduledPiece) {
        self.lanes.add_parallel(piece.time());
        self.parallel.push(piece);
    }

    /// Returns the pieces in the serial lane.
    pub fn serial(&self) -> &[ScheduledPiece] {
        &self.serial
    }

    /// Returns the pieces in the parallel lane.
    pub fn parallel(&self) -> &[ScheduledPiece] {
        &self.parallel
    }

    /// Returns the bucket's total projected time.
    pub fn total_time(&self) -> Duration {
        self.lanes.total_time()
    }

    fn into_planned(self, index: usize) -> PlannedShard {
        let total_time = self.total_time();
        let serial_len = self.serial.len();
        let mut pieces = self.serial;
        pieces.extend(self.parallel);
        PlannedShard {
            index,
            total_time,
            serial_len,
            pieces,
        }
    }
}

/// A finalized shard within a [`RunPlan`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlannedShard {
    index: usize,
    total_time: Duration,
    serial_len: usize,
    pieces: Vec<ScheduledPiece>,
}

impl PlannedShard {
    /// Returns the index of this shard, counting up from 0.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the projected wall-clock time of this shard.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    /// Returns the pieces in this shard: the serial lane followed by the parallel lane.
    pub fn pieces(&self) -> &[ScheduledPiece] {
        &self.pieces
    }

    /// Returns the pieces in the serial lane.
    pub fn serial(&self) -> &[ScheduledPiece] {
        &self.pieces[..self.serial_len]
    }

    /// Returns the pieces in the parallel lane.
    pub fn parallel(&self) -> &[ScheduledPiece] {
        &self.pieces[self.serial_len..]
    }

    /// Returns true if this shard has no pieces.
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// The output of a [`ShardBalancer`]: one [`PlannedShard`] per requested shard.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunPlan {
    width: ParallelWidth,
    threshold: SplitThreshold,
    shards: Vec<PlannedShard>,
}

impl RunPlan {
    /// Returns the shards in this plan, ordered by index.
    pub fn shards(&self) -> &[PlannedShard] {
        &self.shards
    }

    /// Returns the parallel width the plan was computed with.
    pub fn width(&self) -> ParallelWidth {
        self.width
    }

    /// Returns the split threshold the plan was computed with.
    pub fn threshold(&self) -> SplitThreshold {
        self.threshold
    }

    /// Returns the projected time of the slowest shard.
    pub fn max_total_time(&self) -> Duration {
        self.shards
            .iter()
            .map(|shard| shard.total_time)
            .max()
            .unwrap_or_default()
    }

    /// Returns the total number of pieces across all shards.
    pub fn piece_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.pieces.len()).sum()
    }

    /// Iterates over every piece in the plan, shard by shard.
    pub fn iter_pieces(&self) -> impl Iterator<Item = &ScheduledPiece> + '_ {
        self.shards.iter().flat_map(|shard| shard.pieces.iter())
    }
}

/// The greedy shard scheduler.
///
/// The parallel width and split threshold are fixed at construction; the balancer never reads
/// them from the environment.
#[derive(Clone, Copy, Debug)]
pub struct ShardBalancer {
    simulator: CapacitySimulator,
    threshold: SplitThreshold,
}

impl ShardBalancer {
    /// Creates a new balancer.
    pub fn new(width: ParallelWidth, threshold: SplitThreshold) -> Self {
        Self {
            simulator: CapacitySimulator::new(width),
            threshold,
        }
    }

    /// Returns the capacity simulator used by this balancer.
    pub fn simulator(&self) -> &CapacitySimulator {
        &self.simulator
    }

    /// Returns the split threshold used by this balancer.
    pub fn threshold(&self) -> SplitThreshold {
        self.threshold
    }

    /// Partitions `units` into `shard_count` shards.
    ///
    /// If `is_serial` is `None`, every unit is treated as must-serial.
    pub fn compute_run_plan<M>(
        &self,
        units: &[UnitName],
        model: &M,
        is_serial: Option<&dyn MustSerial>,
        shard_count: ShardCount,
    ) -> RunPlan
    where
        M: DurationModel + ?Sized,
    {
        let default_policy = SerialPolicy::All;
        let is_serial = is_serial.unwrap_or(&default_policy);

        let mut known = Vec::with_capacity(units.len());
        let mut unknown = Vec::new();
        for unit in units {
            match model.duration_of(unit.as_str()) {
                Some(duration) => known.push((unit, duration)),
                None => unknown.push(unit),
            }
        }

        let mut pieces: Vec<_> = known
            .into_iter()
            .flat_map(|(unit, duration)| split_unit(unit, Some(duration), self.threshold))
            .collect();
        // Longest first. sort_by is stable, so ties keep encounter order.
        pieces.sort_by(|a, b| b.time().cmp(&a.time()));

        debug!(
            "balancing {} pieces ({} known units, {} unknown) across {shard_count} shards",
            pieces.len(),
            units.len() - unknown.len(),
            unknown.len(),
        );

        let mut buckets: Vec<_> = (0..shard_count.get())
            .map(|_| ShardBucket::new(&self.simulator))
            .collect();

        for piece in pieces {
            let index = least_loaded(&buckets);
            let serial = is_serial.is_serial(piece.name().as_str());
            trace!(
                "placing {piece} ({:?}) on shard {index} ({} lane)",
                piece.time(),
                if serial { "serial" } else { "parallel" },
            );
            if serial {
                buckets[index].push_serial(piece);
            } else {
                buckets[index].push_parallel(piece);
            }
        }

        // Unknown units are dealt out round-robin, starting with the least-loaded shard. Their
        // behavior is unverified, so they always go in the serial lane.
        let mut index = least_loaded(&buckets);
        for unit in unknown {
            trace!("placing unknown-cost unit {unit} on shard {index}");
            buckets[index].push_serial(ScheduledPiece::unknown(unit.clone()));
            index = (index + 1) % buckets.len();
        }

        let shards = buckets
            .into_iter()
            .enumerate()
            .map(|(index, bucket)| bucket.into_planned(index))
            .collect();

        RunPlan {
            width: self.simulator.width(),
            threshold: self.threshold,
            shards,
        }
    }
}

/// Returns the index of the bucket with the lowest projected time. Ties go to the lowest index.
fn least_loaded(buckets: &[ShardBucket]) -> usize {
    buckets
        .iter()
        .enumerate()
        .min_by_key(|(_, bucket)| bucket.total_time())
        .map(|(index, _)| index)
        .expect("shard count is non-zero so there's at least one bucket")
}
