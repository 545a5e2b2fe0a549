// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `shardplan` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum ShardplanExitCode {}

impl ShardplanExitCode {
    /// No errors occurred and shardplan exited normally.
    pub const OK: i32 = 0;

    /// The selected plan contained no pieces to run, but no other errors occurred.
    pub const EMPTY_PLAN: i32 = 4;

    /// A user issue happened while setting up a shardplan invocation: bad configuration, an
    /// invalid shard count, or an unreadable durations table.
    pub const SETUP_ERROR: i32 = 96;

    /// Writing data to stdout or stderr produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
