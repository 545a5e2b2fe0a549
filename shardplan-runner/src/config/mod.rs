// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for shardplan.
//!
//! Configuration is layered: the default config embedded in the binary is read first, and
//! `.config/shardplan.toml` in the workspace root (or a file passed in explicitly) is merged on top.
//! Settings are grouped into profiles, and every profile inherits unset keys from
//! `profile.default`.

mod imp;

pub use imp::*;
