// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use indoc::indoc;
use pretty_assertions::assert_eq;
use shardplan_metadata::RunPlanSummary;
use shardplan_runner::{
    config::ShardplanConfig,
    durations::DurationTable,
    oracle::{LastFailedCache, UnitSnapshot, collect_interesting},
    partition::{ShardBalancer, ShardCount},
    reporter::{OutputFormat, PlanReport, SerializableFormat},
    unit::UnitName,
    width::{NoProbe, discover_width},
};

fn setup_workspace() -> Result<TempWorkspace> {
    let workspace = TempWorkspace::new()?;
    workspace.write(
        ".config/shardplan.toml",
        indoc! {r#"
            [profile.default]
            serial = ["distributed/*"]

            [profile.ci]
            prioritize = false
        "#},
    )?;
    workspace.write(
        "target/shardplan/test-times.json",
        indoc! {r#"
            {
              "test_ops": 1500.0,
              "test_nn": 900.0,
              "distributed/test_c10d": 400.0,
              "test_torch": 300.0,
              "test_cuda": 120.0
            }
        "#},
    )?;
    workspace.write(
        ".pytest_cache/v/cache/lastfailed",
        indoc! {r#"
            {
              "test/test_cuda.py::TestCuda::test_memory_stats": true
            }
        "#},
    )?;
    Ok(workspace)
}

#[test]
fn plan_from_workspace() -> Result<()> {
    let workspace = setup_workspace()?;
    let config = ShardplanConfig::from_sources(workspace.root(), None)?;
    let profile = config.profile(ShardplanConfig::DEFAULT_PROFILE)?;
    ensure!(profile.prioritize(), "prioritization is on by default");

    let table = DurationTable::load(config.store().durations())?;
    let mut requested: Vec<UnitName> = table.units().cloned().collect();
    requested.push(UnitName::new("test_new"));

    let width = profile
        .parallel_width()
        .resolve(|| discover_width(false, &NoProbe));
    let balancer = ShardBalancer::new(width, profile.split_threshold());
    let plan = balancer.compute_run_plan(
        &requested,
        &table,
        Some(profile.serial_policy()),
        ShardCount::new(2)?,
    );

    let failed = LastFailedCache::new(
        config.store().last_failed(),
        config.changes().unit_path_mapping(),
    );
    let changed: UnitSnapshot = ["test_torch"].into_iter().collect();
    let interesting = collect_interesting(&failed, &changed);
    assert_eq!(
        interesting
            .union()
            .into_iter()
            .map(UnitName::as_str)
            .collect::<Vec<_>>(),
        ["test_cuda", "test_torch"]
    );

    let report = PlanReport::new(&plan, Some(&interesting));
    let json = report.to_string(OutputFormat::Serializable(SerializableFormat::JsonPretty))?;
    let summary = RunPlanSummary::parse_json(&json)?;

    assert_eq!(summary.parallel_width, 2);
    assert_eq!(summary.split_threshold_secs, 600.0);
    assert_eq!(summary.shards.len(), 2);

    // test_ops (3 pieces), test_nn (2 pieces), and one piece for everything else.
    let piece_count: usize = summary.shards.iter().map(|shard| shard.pieces.len()).sum();
    assert_eq!(piece_count, 9);

    for shard in &summary.shards {
        // Prioritized pieces form a prefix of each shard.
        let first_regular = shard
            .pieces
            .iter()
            .position(|piece| !piece.prioritized)
            .unwrap_or(shard.pieces.len());
        ensure!(
            shard.pieces[first_regular..]
                .iter()
                .all(|piece| !piece.prioritized),
            "prioritized pieces are not a prefix of shard {}",
            shard.shard
        );

        for piece in &shard.pieces {
            let interesting = piece.unit == "test_cuda" || piece.unit == "test_torch";
            assert_eq!(piece.prioritized, interesting, "{}", piece.unit);
            if piece.unit == "distributed/test_c10d" || piece.unit == "test_new" {
                ensure!(piece.serial, "{} should be serial", piece.unit);
            } else {
                ensure!(!piece.serial, "{} should be parallel", piece.unit);
            }
        }
    }

    Ok(())
}

#[test]
fn plans_are_byte_identical() -> Result<()> {
    let workspace = setup_workspace()?;
    let config = ShardplanConfig::from_sources(workspace.root(), None)?;
    let profile = config.profile("ci")?;
    ensure!(!profile.prioritize(), "ci profile disables prioritization");

    let table = DurationTable::load(config.store().durations())?;
    let requested: Vec<UnitName> = table.units().cloned().collect();

    let render = || -> Result<String> {
        let width = profile
            .parallel_width()
            .resolve(|| discover_width(false, &NoProbe));
        let plan = ShardBalancer::new(width, profile.split_threshold()).compute_run_plan(
            &requested,
            &table,
            Some(profile.serial_policy()),
            ShardCount::new(3)?,
        );
        let report = PlanReport::new(&plan, None);
        Ok(report.to_string(OutputFormat::Serializable(SerializableFormat::Json))?)
    };

    let first = render()?;
    for _ in 0..5 {
        assert_eq!(render()?, first);
    }

    let summary = RunPlanSummary::parse_json(&first)?;
    assert_eq!(summary.parallel_width, 4);
    ensure!(!summary.prioritized, "no prioritization in the ci profile");

    Ok(())
}
