// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plans how to split a test suite across CI shards.
//!
//! `shardplan plan` reads historical test durations, splits long-running test units into pieces,
//! and balances the pieces across shards. Within each shard, units that failed on the last run or
//! were changed relative to the default branch are moved to the front.
//!
//! The scheduling logic lives in the `shardplan-runner` crate; this crate is the command-line
//! front end.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
