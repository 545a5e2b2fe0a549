// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod end_to_end;
mod fixtures;
mod scenarios;
