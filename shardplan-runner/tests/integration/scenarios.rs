// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use pretty_assertions::assert_eq;
use shardplan_runner::{
    durations::{DurationModel, DurationTable},
    prioritize::{InterestingUnits, prioritize},
    split::{ScheduledPiece, SplitThreshold, split_unit},
    unit::UnitName,
};
use std::{collections::BTreeSet, time::Duration};

fn names(pieces: &[ScheduledPiece]) -> Vec<String> {
    pieces.iter().map(|piece| piece.to_string()).collect()
}

#[test]
fn three_units_two_shards() -> Result<()> {
    let table = DurationTable::from_secs([("A", 500.0), ("B", 500.0), ("C", 100.0)]);
    let never_serial = |_: &str| false;
    let plan = plan(&table, &["A", "B", "C"], Some(&never_serial), 1, 2);

    ensure!(
        plan.iter_pieces().all(|piece| !piece.is_split()),
        "no unit exceeds the threshold"
    );

    let shards = plan.shards();
    assert_eq!(names(shards[0].pieces()), ["A 1/1", "C 1/1"]);
    assert_eq!(names(shards[1].pieces()), ["B 1/1"]);
    assert_eq!(shards[0].total_time(), Duration::from_secs(600));
    assert_eq!(shards[1].total_time(), Duration::from_secs(500));
    assert_eq!(plan.max_total_time(), Duration::from_secs(600));

    Ok(())
}

#[test]
fn long_unit_is_split_into_three() {
    let pieces = split_unit(
        &UnitName::new("D"),
        Some(Duration::from_secs(1500)),
        SplitThreshold::DEFAULT,
    );
    assert_eq!(names(&pieces), ["D 1/3", "D 2/3", "D 3/3"]);
    for piece in &pieces {
        assert_eq!(piece.duration(), Some(Duration::from_secs(500)));
    }
}

#[test]
fn interesting_unit_moves_to_front() {
    let table = DurationTable::from_secs([("test_a", 10.0), ("test_foo", 20.0), ("test_b", 30.0)]);
    let input: Vec<_> = ["test_a", "test_foo", "test_b"]
        .into_iter()
        .map(|name| {
            let name = UnitName::new(name);
            let duration = table.duration_of(name.as_str()).expect("duration is known");
            ScheduledPiece::whole(name, duration)
        })
        .collect();
    let interesting = InterestingUnits::new(
        BTreeSet::new(),
        [UnitName::new("test_foo")].into_iter().collect(),
    );

    let result = prioritize(&input, &interesting);
    assert_eq!(names(result.front()), ["test_foo 1/1"]);
    assert_eq!(names(result.rest()), ["test_a 1/1", "test_b 1/1"]);
}

#[test]
fn every_unit_placed_exactly_once() -> Result<()> {
    let table = DurationTable::from_secs([
        ("test_autograd", 1843.2),
        ("test_nn", 2412.9),
        ("test_torch", 412.0),
        ("test_ops", 3021.7),
        ("test_jit", 988.4),
        ("test_cuda", 75.5),
        ("distributed/test_c10d", 640.0),
    ]);
    let requested = [
        "test_autograd",
        "test_nn",
        "test_torch",
        "test_ops",
        "test_jit",
        "test_cuda",
        "distributed/test_c10d",
        "test_brand_new",
        "test_also_new",
    ];
    let is_serial = |unit: &str| unit.starts_with("distributed/") || unit == "test_cuda";
    let plan = plan(&table, &requested, Some(&is_serial), 2, 4);

    let mut expected = Vec::new();
    for name in requested {
        let name = UnitName::new(name);
        let duration = table.duration_of(name.as_str());
        expected.extend(split_unit(&name, duration, SplitThreshold::DEFAULT));
    }

    let placed = piece_counts(plan.iter_pieces());
    ensure!(
        placed.values().all(|count| *count == 1),
        "some piece was placed more than once: {placed:?}"
    );
    assert_eq!(placed, piece_counts(&expected));

    // Unknown units always land in a serial lane.
    for shard in plan.shards() {
        for piece in shard.parallel() {
            ensure!(!piece.is_unknown(), "{piece} is unknown but parallel");
        }
    }

    Ok(())
}
