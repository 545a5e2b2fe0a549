// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Structured access to shardplan's machine-readable output.
//!
//! `shardplan plan --message-format json` serializes a [`RunPlanSummary`]. Tools that drive CI
//! jobs can deserialize it with this crate instead of scraping the human-readable output.

mod exit_codes;
mod plan_summary;

pub use exit_codes::*;
pub use plan_summary::*;
