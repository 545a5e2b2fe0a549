// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The number of parallel execution slots available to each shard.
//!
//! The width is resolved once, at process start, and then passed into the
//! [`ShardBalancer`](crate::partition::ShardBalancer). Hosts with accelerators may expose their own
//! device count through an [`AcceleratorProbe`]; otherwise a small default is used.

use crate::errors::{ParallelWidthParseError, WidthProbeError};
use camino::{Utf8Path, Utf8PathBuf};
use std::{cmp::Ordering, fmt, num::NonZeroUsize, str::FromStr};
use tracing::{debug, trace, warn};

/// The number of parallel slots available to a shard's parallel lane.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ParallelWidth(NonZeroUsize);

impl ParallelWidth {
    /// A single slot: everything runs one at a time.
    pub const SERIAL: Self = Self(NonZeroUsize::MIN);

    /// The width used when nothing more specific is known.
    pub const DEFAULT: Self = Self(NonZeroUsize::new(2).unwrap());

    /// The largest width an accelerator probe may produce.
    pub const MAX_ACCELERATORS: usize = 8;

    /// Creates a new width, returning `None` if `width` is zero.
    pub fn new(width: usize) -> Option<Self> {
        NonZeroUsize::new(width).map(Self)
    }

    /// Returns the width as a `usize`.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for ParallelWidth {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ParallelWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type for the parallel-width config key and `--parallel-width` option.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WidthSetting {
    /// Use the width reported by the environment, see [`discover_width`].
    #[default]
    Auto,

    /// Use a fixed width.
    Count(ParallelWidth),
}

impl WidthSetting {
    /// Resolves this setting to a concrete width.
    ///
    /// `discover` is only called for [`WidthSetting::Auto`].
    pub fn resolve(self, discover: impl FnOnce() -> ParallelWidth) -> ParallelWidth {
        match self {
            Self::Auto => discover(),
            Self::Count(width) => width,
        }
    }
}

impl FromStr for WidthSetting {
    type Err = ParallelWidthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            return Ok(Self::Auto);
        }

        match s.parse::<usize>() {
            Ok(n) => ParallelWidth::new(n)
                .map(Self::Count)
                .ok_or_else(|| ParallelWidthParseError::new(s)),
            Err(_) => Err(ParallelWidthParseError::new(s)),
        }
    }
}

impl fmt::Display for WidthSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Count(width) => write!(f, "{width}"),
        }
    }
}

impl<'de> serde::Deserialize<'de> for WidthSetting {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = WidthSetting;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a positive integer or the string \"auto\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "auto" {
                    Ok(WidthSetting::Auto)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => ParallelWidth::new(v as usize)
                        .map(WidthSetting::Count)
                        .ok_or_else(|| {
                            serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                        }),
                    Ordering::Less | Ordering::Equal => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                ParallelWidth::new(v as usize)
                    .map(WidthSetting::Count)
                    .ok_or_else(|| {
                        serde::de::Error::invalid_value(serde::de::Unexpected::Unsigned(v), &self)
                    })
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// The result of probing the host for accelerators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    /// The probe doesn't apply to this host.
    NotApplicable,

    /// The host exposes this many usable devices.
    Devices(usize),
}

/// An environment-specific probe for the number of usable execution slots.
pub trait AcceleratorProbe {
    /// Probes the host.
    fn probe(&self) -> Result<ProbeOutcome, WidthProbeError>;
}

/// A probe that never applies.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProbe;

impl AcceleratorProbe for NoProbe {
    fn probe(&self) -> Result<ProbeOutcome, WidthProbeError> {
        Ok(ProbeOutcome::NotApplicable)
    }
}

/// Probes ROCm hosts by counting the GPU agents listed by `rocminfo`.
///
/// The probe only applies if the ROCm installation directory exists.
#[derive(Clone, Debug)]
pub struct RocmProbe {
    install_dir: Utf8PathBuf,
    rocminfo: Utf8PathBuf,
}

impl RocmProbe {
    /// The default ROCm installation directory.
    pub const DEFAULT_INSTALL_DIR: &'static str = "/opt/rocm";

    /// Creates a probe that looks for ROCm at `install_dir` and runs `rocminfo` from `PATH`.
    pub fn new(install_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            rocminfo: Utf8PathBuf::from("rocminfo"),
        }
    }

    /// Overrides the `rocminfo` executable.
    pub fn with_rocminfo(mut self, rocminfo: impl Into<Utf8PathBuf>) -> Self {
        self.rocminfo = rocminfo.into();
        self
    }

    /// Returns the installation directory this probe checks for.
    pub fn install_dir(&self) -> &Utf8Path {
        &self.install_dir
    }
}

impl Default for RocmProbe {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INSTALL_DIR)
    }
}

impl AcceleratorProbe for RocmProbe {
    fn probe(&self) -> Result<ProbeOutcome, WidthProbeError> {
        if !self.install_dir.exists() {
            trace!("{} does not exist, skipping ROCm probe", self.install_dir);
            return Ok(ProbeOutcome::NotApplicable);
        }

        let command = self.rocminfo.to_string();
        let expression = duct::cmd(self.rocminfo.as_str(), std::iter::empty::<&str>());
        trace!("Executing command: {:?}", expression);
        let output = expression
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|err| WidthProbeError::Exec {
                command: command.clone(),
                err,
            })?;
        if !output.status.success() {
            return Err(WidthProbeError::Failed {
                command,
                status: output.status.to_string(),
            });
        }

        match count_gfx_agents(&String::from_utf8_lossy(&output.stdout)) {
            0 => Err(WidthProbeError::NoDevices { command }),
            count => Ok(ProbeOutcome::Devices(count)),
        }
    }
}

/// Counts the GPU agents in `rocminfo` output: each one has a `gfx` target name.
pub(crate) fn count_gfx_agents(output: &str) -> usize {
    output.lines().filter(|line| line.contains(" gfx")).count()
}

/// Discovers the parallel width for this process.
///
/// * In single-process diagnostic mode (for example, when checking for memory leaks), the width
///   is always 1 and the probe isn't run.
/// * If the probe doesn't apply, the width is [`ParallelWidth::DEFAULT`].
/// * If the probe reports devices, the width is the device count, capped at
///   [`ParallelWidth::MAX_ACCELERATORS`].
/// * If the probe fails, a warning is logged and the width is 1: on an accelerator host whose
///   devices can't be counted, running serially is the safe choice.
pub fn discover_width(single_process: bool, probe: &dyn AcceleratorProbe) -> ParallelWidth {
    if single_process {
        debug!("single-process mode enabled, using parallel width 1");
        return ParallelWidth::SERIAL;
    }

    match probe.probe() {
        Ok(ProbeOutcome::NotApplicable) => ParallelWidth::DEFAULT,
        Ok(ProbeOutcome::Devices(count)) => {
            let width = count.clamp(1, ParallelWidth::MAX_ACCELERATORS);
            debug!("accelerator probe found {count} devices, using parallel width {width}");
            ParallelWidth::new(width).unwrap_or(ParallelWidth::SERIAL)
        }
        Err(err) => {
            warn!("accelerator probe failed ({err}), using parallel width 1");
            ParallelWidth::SERIAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use test_case::test_case;

    struct FixedProbe(Result<ProbeOutcome, ()>);

    impl AcceleratorProbe for FixedProbe {
        fn probe(&self) -> Result<ProbeOutcome, WidthProbeError> {
            self.0.map_err(|()| WidthProbeError::NoDevices {
                command: "rocminfo".to_owned(),
            })
        }
    }

    #[test_case(false, Ok(ProbeOutcome::NotApplicable), 2; "not applicable")]
    #[test_case(false, Ok(ProbeOutcome::Devices(4)), 4; "four devices")]
    #[test_case(false, Ok(ProbeOutcome::Devices(16)), 8; "capped")]
    #[test_case(false, Err(()), 1; "probe failure")]
    #[test_case(true, Ok(ProbeOutcome::Devices(4)), 1; "single process")]
    #[test_case(true, Ok(ProbeOutcome::NotApplicable), 1; "single process without probe")]
    fn discover(single_process: bool, outcome: Result<ProbeOutcome, ()>, expected: usize) {
        let width = discover_width(single_process, &FixedProbe(outcome));
        assert_eq!(width.get(), expected);
    }

    #[test_case("auto", Ok(WidthSetting::Auto); "auto")]
    #[test_case("3", Ok(WidthSetting::Count(ParallelWidth::new(3).unwrap())); "count")]
    #[test_case("0", Err(()); "zero")]
    #[test_case("-1", Err(()); "negative")]
    #[test_case("num-cpus", Err(()); "unknown string")]
    fn parse_width_setting(input: &str, expected: Result<WidthSetting, ()>) {
        assert_eq!(input.parse::<WidthSetting>().map_err(|_| ()), expected);
    }

    #[test]
    fn count_agents() {
        let output = indoc! {"
            *******
            Agent 1
            *******
              Name:                    AMD Ryzen 9 7950X
            *******
            Agent 2
            *******
              Name:                    gfx90a
              Marketing Name:          AMD Instinct MI250X
            *******
            Agent 3
            *******
              Name:                    gfx90a
        "};
        assert_eq!(count_gfx_agents(output), 2);
    }

    #[test]
    fn rocm_probe_without_install_dir() {
        let temp_dir = Utf8TempDir::new().unwrap();
        let probe = RocmProbe::new(temp_dir.path().join("rocm"));
        assert_eq!(probe.probe().unwrap(), ProbeOutcome::NotApplicable);
    }

    #[test]
    fn rocm_probe_missing_executable() {
        let temp_dir = Utf8TempDir::new().unwrap();
        let probe = RocmProbe::new(temp_dir.path())
            .with_rocminfo(temp_dir.path().join("does-not-exist"));
        let err = probe.probe().unwrap_err();
        assert!(matches!(err, WidthProbeError::Exec { .. }), "{err:?}");
        assert_eq!(discover_width(false, &probe), ParallelWidth::SERIAL);
    }
}
