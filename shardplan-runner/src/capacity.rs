// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Projected wall-clock time for a shard.
//!
//! A shard has two lanes. Pieces in the parallel lane are spread across a fixed number of slots,
//! each piece going to whichever slot is least loaded at the time it's added. Pieces in the serial
//! lane can't share the machine, so their time is always added in full:
//!
//! ```text
//! total = max(slot times) + sum(serial times)
//! ```
//!
//! The simulator doesn't sort. Feeding it pieces longest-first gives the usual
//! longest-processing-time approximation.

use crate::{split::ScheduledPiece, width::ParallelWidth};
use std::time::Duration;

/// The simulated state of one shard's lanes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaneSimulation {
    slots: Vec<Duration>,
    serial: Duration,
}

impl LaneSimulation {
    /// Creates an empty simulation with `width` parallel slots.
    pub fn new(width: ParallelWidth) -> Self {
        Self {
            slots: vec![Duration::ZERO; width.get()],
            serial: Duration::ZERO,
        }
    }

    /// Adds a piece of work to the least-loaded parallel slot, returning the slot's index.
    ///
    /// Ties go to the lowest-numbered slot.
    pub fn add_parallel(&mut self, time: Duration) -> usize {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, slot)| **slot)
            .expect("width is non-zero so there's at least one slot");
        *slot = slot.saturating_add(time);
        index
    }

    /// Adds a piece of work to the serial lane.
    pub fn add_serial(&mut self, time: Duration) {
        self.serial = self.serial.saturating_add(time);
    }

    /// Returns the accumulated time in each parallel slot.
    pub fn slots(&self) -> &[Duration] {
        &self.slots
    }

    /// Returns the time taken by the parallel lane: the most loaded slot.
    pub fn parallel_time(&self) -> Duration {
        self.slots.iter().copied().max().unwrap_or_default()
    }

    /// Returns the time taken by the serial lane.
    pub fn serial_time(&self) -> Duration {
        self.serial
    }

    /// Returns the shard's total projected time.
    pub fn total_time(&self) -> Duration {
        self.parallel_time().saturating_add(self.serial)
    }
}

/// Computes projected shard times for a fixed parallel width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CapacitySimulator {
    width: ParallelWidth,
}

impl CapacitySimulator {
    /// Creates a new simulator.
    pub fn new(width: ParallelWidth) -> Self {
        Self { width }
    }

    /// Returns the parallel width this simulator uses.
    pub fn width(&self) -> ParallelWidth {
        self.width
    }

    /// Returns an empty simulation.
    pub fn empty(&self) -> LaneSimulation {
        LaneSimulation::new(self.width)
    }

    /// Simulates a shard from scratch, placing parallel pieces in the order given.
    pub fn simulate<'a>(
        &self,
        serial: impl IntoIterator<Item = &'a ScheduledPiece>,
        parallel: impl IntoIterator<Item = &'a ScheduledPiece>,
    ) -> LaneSimulation {
        let mut lanes = self.empty();
        for piece in parallel {
            lanes.add_parallel(piece.time());
        }
        for piece in serial {
            lanes.add_serial(piece.time());
        }
        lanes
    }

    /// Returns the total projected time for a shard with the given lanes.
    pub fn total_time(&self, serial: &[ScheduledPiece], parallel: &[ScheduledPiece]) -> Duration {
        self.simulate(serial, parallel).total_time()
    }
}
