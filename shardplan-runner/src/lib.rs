// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core scheduling logic for shardplan.
//!
//! The basic flow is:
//!
//! 1. Look up each unit's expected duration in a [`DurationModel`](durations::DurationModel).
//! 2. [Split](split::split_unit) long units into pieces no longer than the split threshold.
//! 3. Place pieces onto shards, longest first, with the [`ShardBalancer`](partition::ShardBalancer).
//!    Each shard is simulated as a serial lane followed by a fixed-width parallel lane.
//! 4. Optionally [prioritize](prioritize::prioritize) pieces for units that recently failed or
//!    were just changed, so they run first within their shard.

pub mod capacity;
pub mod config;
pub mod durations;
pub mod errors;
pub mod helpers;
pub mod oracle;
pub mod partition;
pub mod prioritize;
pub mod reporter;
pub mod split;
pub mod unit;
pub mod width;
