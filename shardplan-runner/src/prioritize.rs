// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Moving interesting tests to the front of a shard.
//!
//! Tests that failed last time, or that the pending change touches, are the ones most likely to
//! fail now. Running them first shortens the time to the first useful signal. The reordering is a
//! stable partition: no piece is ever dropped or duplicated.

use crate::{
    helpers::{DisplayEstimate, plural},
    split::ScheduledPiece,
    unit::UnitName,
};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    time::Duration,
};
use tracing::error;

/// The set of units to prioritize, and why each was selected.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InterestingUnits {
    previously_failed: BTreeSet<UnitName>,
    changed: BTreeSet<UnitName>,
}

impl InterestingUnits {
    /// Creates a new set from its two sources.
    pub fn new(previously_failed: BTreeSet<UnitName>, changed: BTreeSet<UnitName>) -> Self {
        Self {
            previously_failed,
            changed,
        }
    }

    /// Returns units that failed in the previous run.
    pub fn previously_failed(&self) -> &BTreeSet<UnitName> {
        &self.previously_failed
    }

    /// Returns units touched by the pending change.
    pub fn changed(&self) -> &BTreeSet<UnitName> {
        &self.changed
    }

    /// Returns true if `unit` is in either source.
    pub fn contains(&self, unit: &str) -> bool {
        self.previously_failed.contains(unit) || self.changed.contains(unit)
    }

    /// Returns the union of both sources.
    pub fn union(&self) -> BTreeSet<&UnitName> {
        self.previously_failed.iter().chain(&self.changed).collect()
    }

    /// Returns true if there's nothing to prioritize.
    pub fn is_empty(&self) -> bool {
        self.previously_failed.is_empty() && self.changed.is_empty()
    }
}

/// The result of [`prioritize`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Prioritized {
    front: Vec<ScheduledPiece>,
    rest: Vec<ScheduledPiece>,
    time_savings: Duration,
}

impl Prioritized {
    /// Returns the pieces moved to the front, in their original relative order.
    pub fn front(&self) -> &[ScheduledPiece] {
        &self.front
    }

    /// Returns the remaining pieces, in their original relative order.
    pub fn rest(&self) -> &[ScheduledPiece] {
        &self.rest
    }

    /// Returns roughly how much sooner the prioritized pieces start than they would have without
    /// reordering.
    pub fn time_savings(&self) -> Duration {
        self.time_savings
    }

    /// Returns the reordered sequence: the front followed by the rest.
    pub fn into_sequence(self) -> Vec<ScheduledPiece> {
        let mut sequence = self.front;
        sequence.extend(self.rest);
        sequence
    }

    /// Returns a diagnostic summary of this reordering.
    pub fn summary(&self) -> PrioritizeSummary<'_> {
        PrioritizeSummary { prioritized: self }
    }
}

/// Splits `pieces` into interesting pieces and the rest, preserving relative order in each.
///
/// If the partition ever fails to account for every input piece exactly once, the error is logged
/// and the input is returned unchanged as `rest`.
pub fn prioritize(pieces: &[ScheduledPiece], interesting: &InterestingUnits) -> Prioritized {
    let mut front = Vec::new();
    let mut rest = Vec::new();
    let mut regular_so_far = Duration::ZERO;
    let mut time_savings = None;

    for piece in pieces {
        if interesting.contains(piece.name().as_str()) {
            time_savings.get_or_insert(regular_so_far);
            front.push(piece.clone());
        } else {
            regular_so_far += piece.time();
            rest.push(piece.clone());
        }
    }

    assemble(pieces, front, rest, time_savings.unwrap_or_default())
}

fn assemble(
    input: &[ScheduledPiece],
    front: Vec<ScheduledPiece>,
    rest: Vec<ScheduledPiece>,
    time_savings: Duration,
) -> Prioritized {
    match check_partition(input, &front, &rest) {
        Ok(()) => Prioritized {
            front,
            rest,
            time_savings,
        },
        Err(mismatch) => {
            error!(
                "reordering tests failed ({mismatch}), expected a total of {}, \
                 but found {} prioritized and {} others: running in the original order",
                input.len(),
                front.len(),
                rest.len(),
            );
            Prioritized {
                front: Vec::new(),
                rest: input.to_vec(),
                time_savings: Duration::ZERO,
            }
        }
    }
}

#[derive(Debug)]
enum PartitionMismatch<'a> {
    Count,
    Piece(&'a ScheduledPiece),
}

impl fmt::Display for PartitionMismatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "piece counts differ"),
            Self::Piece(piece) => write!(f, "`{piece}` was dropped or duplicated"),
        }
    }
}

/// Checks that `front` and `rest` together are the same multiset as `input`.
fn check_partition<'a>(
    input: &'a [ScheduledPiece],
    front: &'a [ScheduledPiece],
    rest: &'a [ScheduledPiece],
) -> Result<(), PartitionMismatch<'a>> {
    if input.len() != front.len() + rest.len() {
        return Err(PartitionMismatch::Count);
    }

    let mut counts: HashMap<&ScheduledPiece, isize> = HashMap::with_capacity(input.len());
    for piece in input {
        *counts.entry(piece).or_default() += 1;
    }
    for piece in front.iter().chain(rest) {
        *counts.entry(piece).or_default() -= 1;
    }

    match counts.into_iter().find(|(_, count)| *count != 0) {
        Some((piece, _)) => Err(PartitionMismatch::Piece(piece)),
        None => Ok(()),
    }
}

/// A human-readable summary of a [`Prioritized`] reordering.
///
/// This is purely diagnostic and has no effect on scheduling.
#[derive(Clone, Copy, Debug)]
pub struct PrioritizeSummary<'a> {
    prioritized: &'a Prioritized,
}

impl fmt::Display for PrioritizeSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Prioritized {
            front,
            rest,
            time_savings,
        } = self.prioritized;

        if front.is_empty() {
            return write!(f, "didn't find any tests to prioritize");
        }

        let total = front.len() + rest.len();
        writeln!(
            f,
            "prioritizing {} of {total} {}",
            front.len(),
            plural::tests_str(total),
        )?;
        writeln!(
            f,
            "prioritized tests estimated to run up to {} sooner than they would've otherwise",
            DisplayEstimate(*time_savings),
        )?;
        writeln!(f, "prioritized: {}", DisplayNames(front))?;
        write!(f, "the rest: {}", DisplayNames(rest))
    }
}

struct DisplayNames<'a>(&'a [ScheduledPiece]);

impl fmt::Display for DisplayNames<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, piece) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{piece}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_strategy::proptest;

    fn piece(name: &str, secs: u64) -> ScheduledPiece {
        ScheduledPiece::whole(UnitName::new(name), Duration::from_secs(secs))
    }

    fn changed(names: &[&str]) -> InterestingUnits {
        InterestingUnits::new(
            BTreeSet::new(),
            names.iter().copied().map(UnitName::new).collect(),
        )
    }

    fn names(pieces: &[ScheduledPiece]) -> Vec<&str> {
        pieces.iter().map(|p| p.name().as_str()).collect()
    }

    #[test]
    fn moves_interesting_to_front() {
        let input = vec![piece("test_a", 10), piece("test_foo", 20), piece("test_b", 30)];
        let result = prioritize(&input, &changed(&["test_foo"]));

        assert_eq!(names(result.front()), ["test_foo"]);
        assert_eq!(names(result.rest()), ["test_a", "test_b"]);
        assert_eq!(result.time_savings(), Duration::from_secs(10));
        assert_eq!(
            names(&result.into_sequence()),
            ["test_foo", "test_a", "test_b"]
        );
    }

    #[test]
    fn time_savings_counts_up_to_first_interesting_piece() {
        let input = vec![
            piece("test_a", 10),
            piece("test_x", 1),
            piece("test_b", 30),
            piece("test_y", 1),
        ];
        let interesting = InterestingUnits::new(
            [UnitName::new("test_x")].into_iter().collect(),
            [UnitName::new("test_y")].into_iter().collect(),
        );
        let result = prioritize(&input, &interesting);
        assert_eq!(names(result.front()), ["test_x", "test_y"]);
        assert_eq!(result.time_savings(), Duration::from_secs(10));
    }

    #[test]
    fn split_pieces_move_together() {
        let pieces: Vec<_> = crate::split::split_unit(
            &UnitName::new("test_nn"),
            Some(Duration::from_secs(1500)),
            crate::split::SplitThreshold::DEFAULT,
        );
        let mut input = vec![piece("test_a", 100)];
        input.extend(pieces.iter().cloned());

        let result = prioritize(&input, &changed(&["test_nn"]));
        assert_eq!(result.front(), pieces.as_slice());
        assert_eq!(names(result.rest()), ["test_a"]);
    }

    #[test]
    fn nothing_interesting() {
        let input = vec![piece("test_a", 10), piece("test_b", 20)];
        let result = prioritize(&input, &InterestingUnits::default());
        assert!(result.front().is_empty());
        assert_eq!(result.rest(), input.as_slice());
        assert_eq!(result.time_savings(), Duration::ZERO);
        assert_eq!(result.summary().to_string(), "didn't find any tests to prioritize");
    }

    #[test]
    fn mismatched_partition_falls_back_to_input() {
        let input = vec![piece("test_a", 10), piece("test_b", 20)];

        // Dropped piece.
        let result = assemble(&input, vec![piece("test_b", 20)], Vec::new(), Duration::ZERO);
        assert!(result.front().is_empty());
        assert_eq!(result.rest(), input.as_slice());

        // Duplicated piece with the right count.
        let result = assemble(
            &input,
            vec![piece("test_b", 20)],
            vec![piece("test_b", 20)],
            Duration::from_secs(10),
        );
        assert!(result.front().is_empty());
        assert_eq!(result.rest(), input.as_slice());
        assert_eq!(result.time_savings(), Duration::ZERO);
    }

    #[test]
    fn summary_display() {
        let input = vec![piece("test_a", 90), piece("test_foo", 20), piece("test_b", 30)];
        let result = prioritize(&input, &changed(&["test_foo"]));
        assert_eq!(
            result.summary().to_string(),
            indoc! {"
                prioritizing 1 of 3 tests
                prioritized tests estimated to run up to 1.5m sooner than they would've otherwise
                prioritized: test_foo 1/1
                the rest: test_a 1/1, test_b 1/1"
            }
        );
    }

    #[proptest(cases = 256)]
    fn stable_partition(
        #[strategy(prop::collection::vec((0usize..8, 0u64..100), 0..30))] entries: Vec<(usize, u64)>,
        #[strategy(prop::collection::btree_set(0usize..8, 0..8))] interesting: BTreeSet<usize>,
    ) {
        let input: Vec<_> = entries
            .iter()
            .map(|(unit, secs)| piece(&format!("test_{unit}"), *secs))
            .collect();
        let interesting = InterestingUnits::new(
            interesting
                .iter()
                .map(|unit| UnitName::new(format!("test_{unit}")))
                .collect(),
            BTreeSet::new(),
        );

        let result = prioritize(&input, &interesting);
        prop_assert_eq!(result.front().len() + result.rest().len(), input.len());

        let expected_front: Vec<_> = input
            .iter()
            .filter(|p| interesting.contains(p.name().as_str()))
            .cloned()
            .collect();
        let expected_rest: Vec<_> = input
            .iter()
            .filter(|p| !interesting.contains(p.name().as_str()))
            .cloned()
            .collect();
        prop_assert_eq!(result.front(), expected_front.as_slice());
        prop_assert_eq!(result.rest(), expected_rest.as_slice());
    }
}
