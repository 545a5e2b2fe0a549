// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::{Result, WrapErr};
use shardplan_runner::{
    durations::DurationTable,
    partition::{MustSerial, RunPlan, ShardBalancer, ShardCount},
    split::{ScheduledPiece, SplitThreshold},
    unit::UnitName,
    width::ParallelWidth,
};
use std::collections::BTreeMap;

pub(crate) fn units(names: &[&str]) -> Vec<UnitName> {
    names.iter().copied().map(UnitName::new).collect()
}

pub(crate) fn plan(
    table: &DurationTable,
    names: &[&str],
    is_serial: Option<&dyn MustSerial>,
    width: usize,
    shard_count: usize,
) -> RunPlan {
    let width = ParallelWidth::new(width).expect("width is non-zero");
    let shard_count = ShardCount::new(shard_count).expect("shard count is non-zero");
    ShardBalancer::new(width, SplitThreshold::DEFAULT).compute_run_plan(
        &units(names),
        table,
        is_serial,
        shard_count,
    )
}

/// Counts pieces by identity.
pub(crate) fn piece_counts<'a>(
    pieces: impl IntoIterator<Item = &'a ScheduledPiece>,
) -> BTreeMap<&'a ScheduledPiece, usize> {
    let mut counts = BTreeMap::new();
    for piece in pieces {
        *counts.entry(piece).or_default() += 1;
    }
    counts
}

/// A scratch workspace with shardplan inputs laid out the way the default config expects.
pub(crate) struct TempWorkspace {
    dir: Utf8TempDir,
}

impl TempWorkspace {
    pub(crate) fn new() -> Result<Self> {
        let dir = Utf8TempDir::new().wrap_err("failed to create temp dir")?;
        Ok(Self { dir })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    pub(crate) fn write(&self, rel_path: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {parent}"))?;
        }
        std::fs::write(&path, contents).wrap_err_with(|| format!("failed to write {path}"))
    }
}
