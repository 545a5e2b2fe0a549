// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level application and command routing.

use crate::{
    errors::{ExpectedError, Result},
    output::{OutputContext, OutputOpts, OutputWriter},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use shardplan_metadata::ShardplanExitCode;
use shardplan_runner::{
    config::{ShardplanConfig, ShardplanProfile},
    durations::DurationTable,
    errors::DurationTableError,
    helpers::plural,
    oracle::{GitChangedFiles, LastFailedCache, collect_interesting},
    partition::{MustSerial, ShardBalancer, ShardCount, ShardSelection},
    prioritize::InterestingUnits,
    reporter::{OutputFormat, PlanReport, SerializableFormat},
    unit::UnitName,
    width::{ParallelWidth, RocmProbe, WidthSetting, discover_width},
};
use std::{collections::BTreeSet, io::Write};
use tracing::{debug, info, warn};

/// Plans how to split a test suite across CI shards.
///
/// Long-running test units are split into pieces, pieces are balanced across shards using
/// historical durations, and tests that recently failed or were just changed run first.
#[derive(Debug, Parser)]
#[command(
    name = "shardplan",
    version,
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct ShardplanApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(subcommand)]
    command: Command,
}

impl ShardplanApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        let base = BaseApp::new(output, self.config_opts)?;
        match self.command {
            Command::Plan(opts) => base.exec_plan(opts, output_writer),
            Command::Interesting(opts) => base.exec_interesting(opts, output_writer),
            Command::ShowConfig => base.exec_show_config(output_writer),
        }
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Config options")]
struct ConfigOpts {
    /// Config file [default: workspace-root/.config/shardplan.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Workspace root, used to resolve relative paths [default: current directory]
    #[arg(long, global = true, value_name = "DIR", env = "SHARDPLAN_WORKSPACE_ROOT")]
    workspace_root: Option<Utf8PathBuf>,

    /// The configuration profile to use
    #[arg(
        long,
        short = 'P',
        global = true,
        value_name = "PROFILE",
        env = "SHARDPLAN_PROFILE"
    )]
    profile: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute a shard plan
    ///
    /// Each shard is printed with its projected wall-clock time and its pieces in run order.
    Plan(PlanOpts),

    /// List units that would be prioritized, and why
    Interesting(InterestingOpts),

    /// Show the resolved configuration for a profile
    ShowConfig,
}

#[derive(Debug, Args)]
struct PlanOpts {
    /// Units to schedule [default: every unit in the durations table]
    #[arg(value_name = "UNITS")]
    units: Vec<String>,

    /// Also read units to schedule from this file, one per line
    #[arg(long, value_name = "PATH")]
    units_file: Option<Utf8PathBuf>,

    /// Number of shards to plan
    #[arg(
        long,
        value_name = "N",
        conflicts_with = "shard",
        required_unless_present = "shard"
    )]
    shards: Option<ShardCount>,

    /// Plan N shards, but only output shard M (1-based)
    #[arg(long, value_name = "M/N")]
    shard: Option<ShardSelection>,

    /// Historical durations as JSON [default: from config]
    #[arg(long, value_name = "PATH")]
    durations: Option<Utf8PathBuf>,

    /// Output format
    #[arg(long, short = 'T', value_enum, default_value_t, value_name = "FMT")]
    message_format: MessageFormatOpts,

    /// Don't move previously failed or changed units to the front of each shard
    #[arg(
        long,
        env = "SHARDPLAN_NO_PRIORITIZE",
        value_parser = BoolishValueParser::new(),
        action = ArgAction::SetTrue
    )]
    no_prioritize: bool,

    #[clap(flatten)]
    width: WidthOpts,

    #[clap(flatten)]
    changes: ChangesOpts,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Width options")]
struct WidthOpts {
    /// Parallel slots per shard: "auto" or a positive integer [default: from profile]
    #[arg(long, value_name = "auto|N", env = "SHARDPLAN_PARALLEL_WIDTH")]
    parallel_width: Option<WidthSetting>,

    /// Run every unit one at a time, for memory diagnostics
    #[arg(
        long,
        env = "SHARDPLAN_SINGLE_PROCESS",
        value_parser = BoolishValueParser::new(),
        action = ArgAction::SetTrue
    )]
    single_process: bool,
}

impl WidthOpts {
    fn resolve(&self, profile: &ShardplanProfile<'_>) -> ParallelWidth {
        let setting = self.parallel_width.unwrap_or(profile.parallel_width());
        match setting {
            WidthSetting::Count(_) if self.single_process => {
                debug!("single-process mode overrides parallel-width {setting}");
                ParallelWidth::SERIAL
            }
            setting => {
                setting.resolve(|| discover_width(self.single_process, &RocmProbe::default()))
            }
        }
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Change detection options")]
struct ChangesOpts {
    /// Branch on `origin` to find changes against [default: from config]
    #[arg(long, value_name = "BRANCH", env = "GIT_DEFAULT_BRANCH")]
    default_branch: Option<String>,
}

#[derive(Debug, Args)]
struct InterestingOpts {
    #[clap(flatten)]
    changes: ChangesOpts,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum MessageFormatOpts {
    /// A human-readable output format.
    #[default]
    Human,
    /// JSON with no whitespace.
    Json,
    /// JSON, prettified.
    JsonPretty,
}

impl MessageFormatOpts {
    fn to_output_format(self, verbose: bool) -> OutputFormat {
        match self {
            Self::Human => OutputFormat::Human { verbose },
            Self::Json => OutputFormat::Serializable(SerializableFormat::Json),
            Self::JsonPretty => OutputFormat::Serializable(SerializableFormat::JsonPretty),
        }
    }
}

struct BaseApp {
    output: OutputContext,
    config: ShardplanConfig,
    profile_name: String,
}

impl BaseApp {
    fn new(output: OutputContext, config_opts: ConfigOpts) -> Result<Self> {
        let workspace_root = match config_opts.workspace_root {
            Some(root) => root,
            None => current_dir()?,
        };
        let config =
            ShardplanConfig::from_sources(&workspace_root, config_opts.config_file.as_deref())?;
        let profile_name = config_opts
            .profile
            .unwrap_or_else(|| ShardplanConfig::DEFAULT_PROFILE.to_owned());

        // Check that the profile exists before doing any work.
        config.profile(&profile_name)?;

        Ok(Self {
            output,
            config,
            profile_name,
        })
    }

    fn profile(&self) -> ShardplanProfile<'_> {
        self.config
            .profile(&self.profile_name)
            .expect("profile was checked in BaseApp::new")
    }

    fn exec_plan(&self, opts: PlanOpts, output_writer: &mut OutputWriter) -> Result<i32> {
        let profile = self.profile();

        let table = self.load_durations(opts.durations.as_deref())?;
        let units = collect_units(&opts.units, opts.units_file.as_deref(), &table)?;

        let shard_count = match (opts.shards, &opts.shard) {
            (Some(count), _) => count,
            (None, Some(selection)) => selection.total_shards(),
            (None, None) => unreachable!("clap requires either --shards or --shard"),
        };
        let width = opts.width.resolve(&profile);
        info!(
            "planning {} {} across {shard_count} {} (parallel width {width})",
            units.len(),
            plural::units_str(units.len()),
            plural::shards_str(shard_count.get()),
        );

        let serial_policy: &dyn MustSerial = profile.serial_policy();
        let balancer = ShardBalancer::new(width, profile.split_threshold());
        let plan = balancer.compute_run_plan(&units, &table, Some(serial_policy), shard_count);

        let interesting = if profile.prioritize() && !opts.no_prioritize {
            Some(self.interesting(&opts.changes))
        } else {
            debug!("prioritization disabled");
            None
        };

        let report = match &opts.shard {
            Some(selection) => PlanReport::for_selection(&plan, selection, interesting.as_ref())?,
            None => PlanReport::new(&plan, interesting.as_ref()),
        };

        let colorize = self
            .output
            .color
            .should_colorize(supports_color::Stream::Stdout);
        let mut writer = output_writer.stdout_writer();
        report.write(
            opts.message_format.to_output_format(self.output.verbose),
            &mut writer,
            colorize,
        )?;
        writer.flush().map_err(ExpectedError::write_output_error)?;

        // A selected shard can be empty while the plan as a whole isn't.
        if plan.piece_count() == 0 {
            warn!("no units to schedule");
            return Ok(ShardplanExitCode::EMPTY_PLAN);
        }
        Ok(ShardplanExitCode::OK)
    }

    fn exec_interesting(
        &self,
        opts: InterestingOpts,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let interesting = self.interesting(&opts.changes);

        let mut writer = output_writer.stdout_writer();
        write_interesting(
            &mut writer,
            "previously failed",
            interesting.previously_failed(),
        )
        .and_then(|()| write_interesting(&mut writer, "changed", interesting.changed()))
            .and_then(|()| writer.flush())
            .map_err(ExpectedError::write_output_error)?;

        Ok(ShardplanExitCode::OK)
    }

    fn exec_show_config(&self, output_writer: &mut OutputWriter) -> Result<i32> {
        let profile = self.profile();
        let store = self.config.store();
        let changes = self.config.changes();
        let mapping = changes.unit_path_mapping();

        let mut writer = output_writer.stdout_writer();
        let mut write = || -> std::io::Result<()> {
            writeln!(writer, "profile: {}", profile.name())?;
            writeln!(
                writer,
                "  split-threshold: {}s",
                profile.split_threshold().get().as_secs_f64()
            )?;
            writeln!(writer, "  parallel-width: {}", profile.parallel_width())?;
            if profile.serial_patterns().is_empty() {
                writeln!(writer, "  serial: (no patterns)")?;
            } else {
                writeln!(writer, "  serial:")?;
                for pattern in profile.serial_patterns() {
                    writeln!(writer, "    - {pattern}")?;
                }
            }
            writeln!(writer, "  serial-by-default: {}", profile.serial_by_default())?;
            writeln!(writer, "  prioritize: {}", profile.prioritize())?;
            writeln!(writer, "store:")?;
            writeln!(writer, "  durations: {}", store.durations())?;
            writeln!(writer, "  last-failed: {}", store.last_failed())?;
            writeln!(writer, "changes:")?;
            writeln!(writer, "  default-branch: {}", changes.default_branch())?;
            writeln!(writer, "  unit-prefix: {}", mapping.prefix())?;
            writeln!(writer, "  unit-suffix: {}", mapping.suffix())?;
            writer.flush()
        };
        write().map_err(ExpectedError::write_output_error)?;

        Ok(ShardplanExitCode::OK)
    }

    fn load_durations(&self, explicit: Option<&Utf8Path>) -> Result<DurationTable> {
        let path = explicit.unwrap_or(self.config.store().durations());
        match DurationTable::load(path) {
            Ok(table) => Ok(table),
            Err(DurationTableError::Read { err, .. })
                if explicit.is_none() && err.kind() == std::io::ErrorKind::NotFound =>
            {
                warn!("no durations found at {path}, every unit will be treated as unknown");
                Ok(DurationTable::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn interesting(&self, opts: &ChangesOpts) -> InterestingUnits {
        let changes = self.config.changes();
        let failed = LastFailedCache::new(
            self.config.store().last_failed(),
            changes.unit_path_mapping(),
        );
        let changed = GitChangedFiles::new(
            self.config.workspace_root(),
            changes.unit_path_mapping(),
        )
        .with_default_branch(
            opts.default_branch
                .as_deref()
                .unwrap_or(changes.default_branch()),
        );
        collect_interesting(&failed, &changed)
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir().map_err(|err| ExpectedError::CurrentDirFailed { err })?;
    Utf8PathBuf::try_from(dir).map_err(|err| ExpectedError::CurrentDirInvalidUtf8 { err })
}

/// Returns the units named on the command line and in `units_file`, or every unit in `table` if
/// neither names any.
fn collect_units(
    args: &[String],
    units_file: Option<&Utf8Path>,
    table: &DurationTable,
) -> Result<Vec<UnitName>> {
    let mut units: Vec<UnitName> = args.iter().map(UnitName::new).collect();
    if let Some(path) = units_file {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ExpectedError::units_file_read_error(path, err))?;
        units.extend(parse_units_file(&contents));
    }

    if units.is_empty() && args.is_empty() && units_file.is_none() {
        debug!("no units given, using all {} units with known durations", table.len());
        units.extend(table.units().cloned());
    }
    Ok(units)
}

fn parse_units_file(contents: &str) -> impl Iterator<Item = UnitName> + '_ {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(UnitName::new)
}

fn write_interesting(
    writer: &mut impl Write,
    source: &str,
    units: &BTreeSet<UnitName>,
) -> std::io::Result<()> {
    if units.is_empty() {
        return writeln!(writer, "{source}: (none)");
    }
    writeln!(writer, "{source}:")?;
    for unit in units {
        writeln!(writer, "  {unit}")?;
    }
    Ok(())
}
