// Copyright (c) The shardplan Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    oracle::UnitPathMapping,
    partition::SerialPolicy,
    split::SplitThreshold,
    width::WidthSetting,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Trait for handling configuration warnings.
///
/// The default implementation logs warnings; tests collect them instead.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    );
}

/// Default implementation of [`ConfigWarnings`] that logs warnings using the tracing crate.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        workspace_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    ) {
        let mut unknown_str = String::new();
        if let [ignored_key] = unknown.iter().collect::<Vec<_>>().as_slice() {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.push_str(ignored_key);
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!(
            "in config file {}, ignoring unknown configuration {unknown_str}",
            config_file
                .strip_prefix(workspace_root)
                .unwrap_or(config_file),
        )
    }
}

/// Overall configuration for shardplan.
///
/// Scheduling settings are managed through [profiles](ShardplanProfile), obtained through the
/// [`profile`](Self::profile) method.
#[derive(Clone, Debug)]
pub struct ShardplanConfig {
    workspace_root: Utf8PathBuf,
    store: StoreConfig,
    changes: ChangesConfig,
    default_profile: DefaultProfileImpl,
    other_profiles: HashMap<String, CustomProfileImpl>,
    serial_policies: HashMap<String, SerialPolicy>,
}

impl ShardplanConfig {
    /// The default location of the config within the workspace: `.config/shardplan.toml`.
    pub const CONFIG_PATH: &'static str = ".config/shardplan.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/shardplan.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/shardplan.toml`, uses
    /// the default config options.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_with_warnings(workspace_root, config_file, &mut DefaultConfigWarnings)
    }

    /// Loads configuration from the given sources with custom warning handling.
    pub fn from_sources_with_warnings(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();

        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };
        debug!("reading config from {config_file}");

        let builder = Self::make_default_config().add_source(source);
        let (deserialized, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &workspace_root, &unknown);
        }

        deserialized
            .into_config(workspace_root)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))
    }

    /// Returns the default config, with no repository-specific overrides.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let (deserialized, unknown) =
            Self::build_and_deserialize_config(&Self::make_default_config())
                .expect("default config is always valid");

        // The default config is shipped with the binary, so it mustn't contain unknown keys.
        assert!(
            unknown.is_empty(),
            "found unknown keys in default config: {unknown:?}"
        );

        deserialized
            .into_config(workspace_root.into())
            .expect("default config is always valid")
    }

    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the store configuration, with paths resolved against the workspace root.
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    /// Returns the change detection configuration.
    pub fn changes(&self) -> &ChangesConfig {
        &self.changes
    }

    /// Returns the profile with the given name, or an error if it wasn't found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<ShardplanProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = match name {
            Self::DEFAULT_PROFILE => None,
            other => Some(
                self.other_profiles
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(name, self.profile_names()))?,
            ),
        };
        let serial_policy = self
            .serial_policies
            .get(name)
            .expect("serial policies are compiled for every profile");

        Ok(ShardplanProfile {
            name: name.to_owned(),
            default_profile: &self.default_profile,
            custom_profile,
            serial_policy,
        })
    }

    /// Returns the names of all known profiles.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.other_profiles
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(Self::DEFAULT_PROFILE))
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(ShardplanConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: ShardplanConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // serde_path_to_error already reports the key, so drop it from the config error.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// Where shardplan reads its inputs from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreConfig {
    durations: Utf8PathBuf,
    last_failed: Utf8PathBuf,
}

impl StoreConfig {
    /// Returns the absolute path to the historical durations table.
    pub fn durations(&self) -> &Utf8Path {
        &self.durations
    }

    /// Returns the absolute path to the last-failed cache.
    pub fn last_failed(&self) -> &Utf8Path {
        &self.last_failed
    }
}

/// How changed files are found and mapped to units.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ChangesConfig {
    default_branch: String,
    unit_prefix: String,
    unit_suffix: String,
}

impl ChangesConfig {
    /// Returns the branch on `origin` that changes are compared against.
    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Returns the mapping from changed files to units.
    pub fn unit_path_mapping(&self) -> UnitPathMapping {
        UnitPathMapping::new(&self.unit_prefix, &self.unit_suffix)
    }
}

/// A scheduling profile.
///
/// Returned by [`ShardplanConfig::profile`].
#[derive(Clone, Debug)]
pub struct ShardplanProfile<'cfg> {
    name: String,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
    serial_policy: &'cfg SerialPolicy,
}

/// Returns a field from the custom profile if set, falling back to the default profile.
macro_rules! profile_field {
    ($profile:ident.$field:ident) => {
        $profile
            .custom_profile
            .and_then(|p| p.$field)
            .unwrap_or($profile.default_profile.$field)
    };
}

impl<'cfg> ShardplanProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the threshold above which units are split.
    pub fn split_threshold(&self) -> SplitThreshold {
        profile_field!(self.split_threshold)
    }

    /// Returns the configured parallel width.
    pub fn parallel_width(&self) -> WidthSetting {
        profile_field!(self.parallel_width)
    }

    /// Returns the configured serial patterns.
    pub fn serial_patterns(&self) -> &'cfg [String] {
        self.custom_profile
            .and_then(|p| p.serial.as_deref())
            .unwrap_or(&self.default_profile.serial)
    }

    /// Returns whether units are serial when no patterns are configured.
    pub fn serial_by_default(&self) -> bool {
        profile_field!(self.serial_by_default)
    }

    /// Returns the compiled serial policy.
    pub fn serial_policy(&self) -> &'cfg SerialPolicy {
        self.serial_policy
    }

    /// Returns whether interesting units are moved to the front of each shard.
    pub fn prioritize(&self) -> bool {
        profile_field!(self.prioritize)
    }
}

// This is the form of `ShardplanConfig` that gets deserialized.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ShardplanConfigDeserialize {
    store: StoreConfigImpl,
    changes: ChangesConfig,
    #[serde(rename = "profile")]
    profiles: HashMap<String, CustomProfileImpl>,
}

impl ShardplanConfigDeserialize {
    fn into_config(
        mut self,
        workspace_root: Utf8PathBuf,
    ) -> Result<ShardplanConfig, ConfigParseErrorKind> {
        let p = self
            .profiles
            .remove(ShardplanConfig::DEFAULT_PROFILE)
            .expect("default profile should exist");
        let default_profile = DefaultProfileImpl::new(p);

        let mut serial_policies = HashMap::with_capacity(self.profiles.len() + 1);
        serial_policies.insert(
            ShardplanConfig::DEFAULT_PROFILE.to_owned(),
            compile_serial(
                ShardplanConfig::DEFAULT_PROFILE,
                &default_profile.serial,
                default_profile.serial_by_default,
            )?,
        );
        for (name, custom) in &self.profiles {
            let patterns = custom.serial.as_deref().unwrap_or(&default_profile.serial);
            let by_default = custom
                .serial_by_default
                .unwrap_or(default_profile.serial_by_default);
            serial_policies.insert(name.clone(), compile_serial(name, patterns, by_default)?);
        }

        Ok(ShardplanConfig {
            store: StoreConfig {
                durations: workspace_root.join(&self.store.durations),
                last_failed: workspace_root.join(&self.store.last_failed),
            },
            workspace_root,
            changes: self.changes,
            default_profile,
            other_profiles: self.profiles,
            serial_policies,
        })
    }
}

fn compile_serial(
    profile: &str,
    patterns: &[String],
    by_default: bool,
) -> Result<SerialPolicy, ConfigParseErrorKind> {
    SerialPolicy::from_patterns(patterns, by_default).map_err(|err| {
        ConfigParseErrorKind::SerialPattern {
            profile: profile.to_owned(),
            err,
        }
    })
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreConfigImpl {
    durations: Utf8PathBuf,
    last_failed: Utf8PathBuf,
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    split_threshold: SplitThreshold,
    parallel_width: WidthSetting,
    serial: Vec<String>,
    serial_by_default: bool,
    prioritize: bool,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            split_threshold: p
                .split_threshold
                .expect("split-threshold present in default profile"),
            parallel_width: p
                .parallel_width
                .expect("parallel-width present in default profile"),
            // An empty array may be dropped while merging sources.
            serial: p.serial.unwrap_or_default(),
            serial_by_default: p
                .serial_by_default
                .expect("serial-by-default present in default profile"),
            prioritize: p.prioritize.expect("prioritize present in default profile"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    split_threshold: Option<SplitThreshold>,
    #[serde(default)]
    parallel_width: Option<WidthSetting>,
    #[serde(default)]
    serial: Option<Vec<String>>,
    #[serde(default)]
    serial_by_default: Option<bool>,
    #[serde(default)]
    prioritize: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{partition::MustSerial, width::ParallelWidth};
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct TestConfigWarnings {
        unknown_keys: Vec<(Utf8PathBuf, BTreeSet<String>)>,
    }

    impl ConfigWarnings for TestConfigWarnings {
        fn unknown_config_keys(
            &mut self,
            config_file: &Utf8Path,
            _workspace_root: &Utf8Path,
            unknown: &BTreeSet<String>,
        ) {
            self.unknown_keys
                .push((config_file.to_owned(), unknown.clone()));
        }
    }

    fn temp_workspace(contents: &str) -> Utf8TempDir {
        let temp_dir = Utf8TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("shardplan.toml"), contents).unwrap();
        temp_dir
    }

    fn load(
        workspace: &Utf8TempDir,
    ) -> (Result<ShardplanConfig, ConfigParseError>, TestConfigWarnings) {
        let mut warnings = TestConfigWarnings::default();
        let config =
            ShardplanConfig::from_sources_with_warnings(workspace.path(), None, &mut warnings);
        (config, warnings)
    }

    #[test]
    fn default_config_is_valid() {
        let config = ShardplanConfig::default_config("/fake/workspace");

        let profile = config.profile(ShardplanConfig::DEFAULT_PROFILE).unwrap();
        assert_eq!(profile.split_threshold(), SplitThreshold::DEFAULT);
        assert_eq!(profile.parallel_width(), WidthSetting::Auto);
        assert!(profile.serial_patterns().is_empty());
        assert!(profile.serial_by_default());
        assert!(profile.serial_policy().is_serial("test_nn"));
        assert!(profile.prioritize());

        let ci = config.profile("ci").unwrap();
        assert_eq!(
            ci.parallel_width(),
            WidthSetting::Count(ParallelWidth::new(4).unwrap())
        );
        assert_eq!(ci.split_threshold(), SplitThreshold::DEFAULT);

        assert_eq!(
            config.store().durations(),
            "/fake/workspace/target/shardplan/test-times.json"
        );
        assert_eq!(
            config.store().last_failed(),
            "/fake/workspace/.pytest_cache/v/cache/lastfailed"
        );
        assert_eq!(config.changes().default_branch(), "main");
        assert_eq!(config.changes().unit_path_mapping(), UnitPathMapping::default());
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let temp_dir = Utf8TempDir::new().unwrap();
        let mut warnings = TestConfigWarnings::default();
        let config =
            ShardplanConfig::from_sources_with_warnings(temp_dir.path(), None, &mut warnings)
                .unwrap();
        assert!(warnings.unknown_keys.is_empty());
        assert!(config.profile("default").unwrap().prioritize());
    }

    #[test]
    fn custom_profiles_inherit_from_default() {
        let workspace = temp_workspace(indoc! {r#"
            [store]
            durations = "/abs/times.json"

            [changes]
            default-branch = "trunk"

            [profile.default]
            split-threshold = "5m"

            [profile.nightly]
            parallel-width = 8
            prioritize = false

            [profile.gpu]
            serial = ["test_cuda*", "distributed/*"]

            [profile.everything-parallel]
            serial-by-default = false
        "#});
        let (config, warnings) = load(&workspace);
        let config = config.unwrap();
        assert!(warnings.unknown_keys.is_empty());

        assert_eq!(config.store().durations(), "/abs/times.json");
        assert_eq!(config.changes().default_branch(), "trunk");

        let default = config.profile("default").unwrap();
        assert_eq!(default.split_threshold().get(), Duration::from_secs(300));
        assert!(default.serial_policy().is_serial("test_nn"));

        let nightly = config.profile("nightly").unwrap();
        assert_eq!(nightly.split_threshold().get(), Duration::from_secs(300));
        assert_eq!(
            nightly.parallel_width(),
            WidthSetting::Count(ParallelWidth::new(8).unwrap())
        );
        assert!(nightly.serial_patterns().is_empty());
        assert!(!nightly.prioritize());

        let gpu = config.profile("gpu").unwrap();
        assert_eq!(gpu.serial_patterns(), ["test_cuda*", "distributed/*"]);
        assert!(gpu.serial_policy().is_serial("test_cuda_graphs"));
        assert!(gpu.serial_policy().is_serial("distributed/test_c10d"));
        assert!(!gpu.serial_policy().is_serial("test_nn"));
        assert!(gpu.prioritize());

        let parallel = config.profile("everything-parallel").unwrap();
        assert!(!parallel.serial_policy().is_serial("test_cuda_graphs"));
    }

    #[test]
    fn unknown_keys_are_reported() {
        let workspace = temp_workspace(indoc! {r#"
            [store]
            artifacts = "target/artifacts"

            [profile.default]
            retries = 3
        "#});
        let (config, warnings) = load(&workspace);
        config.unwrap();

        assert_eq!(warnings.unknown_keys.len(), 1);
        let (config_file, unknown) = &warnings.unknown_keys[0];
        assert_eq!(config_file, &workspace.path().join(ShardplanConfig::CONFIG_PATH));
        assert_eq!(
            unknown.iter().map(String::as_str).collect::<Vec<_>>(),
            ["profile.default.retries", "store.artifacts"]
        );
    }

    #[test]
    fn profile_not_found() {
        let config = ShardplanConfig::default_config("/fake/workspace");
        let err = config.profile("nonexistent").unwrap_err();
        assert_eq!(
            err.to_string(),
            "profile `nonexistent` not found (known profiles: ci, default)"
        );
    }

    #[test]
    fn zero_split_threshold_is_rejected() {
        let workspace = temp_workspace(indoc! {r#"
            [profile.default]
            split-threshold = "0s"
        "#});
        let (config, _) = load(&workspace);
        let err = config.unwrap_err();
        match err.kind() {
            ConfigParseErrorKind::DeserializeError(err) => {
                assert_eq!(err.path().to_string(), "profile.default.split-threshold");
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn invalid_parallel_width_is_rejected() {
        let workspace = temp_workspace(indoc! {r#"
            [profile.ci]
            parallel-width = 0
        "#});
        let (config, _) = load(&workspace);
        let err = config.unwrap_err();
        assert!(
            matches!(err.kind(), ConfigParseErrorKind::DeserializeError(_)),
            "unexpected error kind: {:?}",
            err.kind()
        );
    }

    #[test]
    fn invalid_serial_pattern_is_rejected() {
        let workspace = temp_workspace(indoc! {r#"
            [profile.gpu]
            serial = ["test_[cuda"]
        "#});
        let (config, _) = load(&workspace);
        let err = config.unwrap_err();
        match err.kind() {
            ConfigParseErrorKind::SerialPattern { profile, err } => {
                assert_eq!(profile, "gpu");
                assert_eq!(err.pattern(), "test_[cuda");
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn explicit_config_file_must_exist() {
        let temp_dir = Utf8TempDir::new().unwrap();
        let config_file = temp_dir.path().join("missing.toml");
        let err = ShardplanConfig::from_sources(temp_dir.path(), Some(&config_file)).unwrap_err();
        assert_eq!(err.config_file(), config_file);
        assert!(
            matches!(err.kind(), ConfigParseErrorKind::BuildError(_)),
            "unexpected error kind: {:?}",
            err.kind()
        );
    }
}
