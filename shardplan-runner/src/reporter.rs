// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Displaying run plans.
//!
//! A [`PlanReport`] is the final, ordered form of a [`RunPlan`]: each shard's pieces in the order
//! they should run, with interesting pieces moved to the front if prioritization is enabled.

use crate::{
    errors::{ShardSelectionMismatch, WritePlanError},
    helpers::{DisplayBracketedDuration, DisplayEstimate, plural},
    partition::{PlannedShard, RunPlan, ShardSelection},
    prioritize::{InterestingUnits, prioritize},
    split::ScheduledPiece,
};
use owo_colors::{OwoColorize, Style};
use serde::Serialize;
use shardplan_metadata::{PieceSummary, RunPlanSummary, ShardSummary};
use std::{collections::HashSet, io, io::Write};
use tracing::info;

/// Output formats for run plans.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    /// A human-readable output format.
    Human {
        /// Whether to produce verbose output.
        verbose: bool,
    },

    /// Machine-readable output format.
    Serializable(SerializableFormat),
}

/// A serialized, machine-readable output format.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SerializableFormat {
    /// JSON with no whitespace.
    Json,
    /// JSON, prettified.
    JsonPretty,
}

impl SerializableFormat {
    /// Write this data in the given format to the writer.
    pub fn to_writer(
        self,
        value: &impl Serialize,
        writer: impl io::Write,
    ) -> serde_json::Result<()> {
        match self {
            SerializableFormat::Json => serde_json::to_writer(writer, value),
            SerializableFormat::JsonPretty => serde_json::to_writer_pretty(writer, value),
        }
    }
}

/// A piece in its final position within a shard.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrderedPiece {
    /// The piece.
    pub piece: ScheduledPiece,

    /// Whether the piece runs in the serial lane.
    pub serial: bool,

    /// Whether the piece was moved to the front.
    pub prioritized: bool,
}

/// A shard with its pieces in run order.
#[derive(Clone, Debug)]
pub struct OrderedShard<'a> {
    shard: &'a PlannedShard,
    pieces: Vec<OrderedPiece>,
}

impl<'a> OrderedShard<'a> {
    fn new(shard: &'a PlannedShard, interesting: Option<&InterestingUnits>) -> Self {
        let serial: HashSet<&ScheduledPiece> = shard.serial().iter().collect();
        let classify = |piece: ScheduledPiece, prioritized: bool| OrderedPiece {
            serial: serial.contains(&piece),
            piece,
            prioritized,
        };

        let pieces = match interesting {
            Some(interesting) => {
                let prioritized = prioritize(shard.pieces(), interesting);
                info!(
                    "shard {}: {}",
                    shard.index() + 1,
                    prioritized.summary(),
                );
                let front_len = prioritized.front().len();
                prioritized
                    .into_sequence()
                    .into_iter()
                    .enumerate()
                    .map(|(i, piece)| classify(piece, i < front_len))
                    .collect()
            }
            None => shard
                .pieces()
                .iter()
                .map(|piece| classify(piece.clone(), false))
                .collect(),
        };

        Self { shard, pieces }
    }

    /// Returns the underlying planned shard.
    pub fn shard(&self) -> &'a PlannedShard {
        self.shard
    }

    /// Returns the pieces in run order.
    pub fn pieces(&self) -> &[OrderedPiece] {
        &self.pieces
    }
}

/// A run plan with every shard in its final order.
#[derive(Clone, Debug)]
pub struct PlanReport<'a> {
    plan: &'a RunPlan,
    prioritized: bool,
    shards: Vec<OrderedShard<'a>>,
}

impl<'a> PlanReport<'a> {
    /// Orders every shard in `plan`.
    ///
    /// If `interesting` is `Some`, each shard's interesting pieces are moved to its front.
    pub fn new(plan: &'a RunPlan, interesting: Option<&InterestingUnits>) -> Self {
        let shards = plan
            .shards()
            .iter()
            .map(|shard| OrderedShard::new(shard, interesting))
            .collect();
        Self {
            plan,
            prioritized: interesting.is_some(),
            shards,
        }
    }

    /// Orders only the shard in `plan` picked by `selection`.
    ///
    /// Shards that aren't selected are never prioritized, so no summary is logged for them.
    pub fn for_selection(
        plan: &'a RunPlan,
        selection: &ShardSelection,
        interesting: Option<&InterestingUnits>,
    ) -> Result<Self, ShardSelectionMismatch> {
        let shard = selection.select(plan)?;
        Ok(Self {
            plan,
            prioritized: interesting.is_some(),
            shards: vec![OrderedShard::new(shard, interesting)],
        })
    }

    /// Returns the shards in this report.
    pub fn shards(&self) -> &[OrderedShard<'a>] {
        &self.shards
    }

    /// Returns true if no shard in this report has any pieces.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.pieces.is_empty())
    }

    /// Converts this report into its serializable form.
    pub fn to_summary(&self) -> RunPlanSummary {
        RunPlanSummary {
            parallel_width: self.plan.width().get(),
            split_threshold_secs: self.plan.threshold().get().as_secs_f64(),
            prioritized: self.prioritized,
            shards: self
                .shards
                .iter()
                .map(|shard| ShardSummary {
                    shard: shard.shard.index() + 1,
                    projected_secs: shard.shard.total_time().as_secs_f64(),
                    pieces: shard
                        .pieces
                        .iter()
                        .map(|ordered| PieceSummary {
                            unit: ordered.piece.name().as_smol_str().clone(),
                            piece: ordered.piece.piece(),
                            total_pieces: ordered.piece.total_pieces(),
                            duration_secs: ordered.piece.duration().map(|d| d.as_secs_f64()),
                            serial: ordered.serial,
                            prioritized: ordered.prioritized,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Outputs this report to the given writer.
    pub fn write(
        &self,
        output_format: OutputFormat,
        writer: impl Write,
        colorize: bool,
    ) -> Result<(), WritePlanError> {
        match output_format {
            OutputFormat::Human { verbose } => self
                .write_human(writer, verbose, colorize)
                .map_err(WritePlanError::Io),
            OutputFormat::Serializable(format) => format
                .to_writer(&self.to_summary(), writer)
                .map_err(WritePlanError::Json),
        }
    }

    /// Outputs this report as a string with the given format.
    pub fn to_string(&self, output_format: OutputFormat) -> Result<String, WritePlanError> {
        let mut buf = Vec::with_capacity(1024);
        self.write(output_format, &mut buf, false)?;
        Ok(String::from_utf8(buf).expect("buffer is valid UTF-8"))
    }

    fn write_human(&self, mut writer: impl Write, verbose: bool, colorize: bool) -> io::Result<()> {
        let mut styles = Styles::default();
        if colorize {
            styles.colorize();
        }

        if verbose {
            writeln!(
                writer,
                "{} {}",
                "parallel width:".style(styles.field),
                self.plan.width(),
            )?;
            writeln!(
                writer,
                "{} {}",
                "split threshold:".style(styles.field),
                DisplayEstimate(self.plan.threshold().get()),
            )?;
        }

        let total_shards = self.plan.shards().len();
        for shard in &self.shards {
            let piece_count = shard.pieces.len();
            writeln!(
                writer,
                "{} {}: projected {}, {} {}",
                "shard".style(styles.shard),
                format!("{}/{total_shards}", shard.shard.index() + 1).style(styles.shard),
                DisplayEstimate(shard.shard.total_time()).style(styles.count),
                piece_count.style(styles.count),
                plural::pieces_str(piece_count),
            )?;

            if shard.pieces.is_empty() {
                writeln!(writer, "    (no pieces)")?;
                continue;
            }
            for ordered in &shard.pieces {
                write!(writer, "    ")?;
                match ordered.piece.duration() {
                    Some(duration) => write!(writer, "{}", DisplayBracketedDuration(duration))?,
                    None => write!(writer, "{}", "[    unknown]".style(styles.unknown))?,
                }
                write!(writer, " {}", ordered.piece.name().style(styles.unit))?;
                if verbose || ordered.piece.is_split() {
                    write!(
                        writer,
                        " {}/{}",
                        ordered.piece.piece(),
                        ordered.piece.total_pieces(),
                    )?;
                }
                if ordered.serial {
                    write!(writer, " {}", "(serial)".style(styles.serial))?;
                }
                if ordered.prioritized {
                    write!(writer, " {}", "(prioritized)".style(styles.prioritized))?;
                }
                writeln!(writer)?;
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    shard: Style,
    count: Style,
    field: Style,
    unit: Style,
    unknown: Style,
    serial: Style,
    prioritized: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.shard = Style::new().bold();
        self.count = Style::new().bold();
        self.field = Style::new().yellow();
        self.unit = Style::new().blue().bold();
        self.unknown = Style::new().dimmed();
        self.serial = Style::new().magenta();
        self.prioritized = Style::new().green().bold();
    }
}
