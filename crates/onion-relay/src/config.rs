//! Types and functions to configure an onion relay.
//!
//! The configuration is a TOML document with four sections:
//!
//! ```toml
//! [relay]
//! agent_id = 1234
//! listen = 9001
//!
//! [channel]
//! connect_timeout = "10s"
//! handshake_timeout = "10s"
//! idle_timeout = "10 min"
//!
//! [system]
//! shutdown_timeout = "20s"
//!
//! [logging]
//! console = "info"
//! ```

pub mod listen;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use derive_builder::Builder;
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::metadata::Level;
use tracing_subscriber::filter::EnvFilter;

pub use listen::{Listen, ListenError};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// An error that occurred while building a configuration object.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },
    /// A single field had a value that proved to be unusable.
    #[error("Value of {field} was incorrect: {problem}")]
    Invalid {
        /// The name of the invalid field
        field: String,
        /// A description of the problem.
        problem: String,
    },
}

impl From<derive_builder::UninitializedFieldError> for ConfigBuildError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        ConfigBuildError::MissingField {
            field: val.field_name().to_string(),
        }
    }
}

impl ConfigBuildError {
    /// Return a new ConfigBuildError that prefixes its field name with
    /// `prefix` and a dot.
    #[must_use]
    pub fn within(&self, prefix: &str) -> Self {
        use ConfigBuildError::*;
        match self {
            MissingField { field } => MissingField {
                field: format!("{}.{}", prefix, field),
            },
            Invalid { field, problem } => Invalid {
                field: format!("{}.{}", prefix, field),
                problem: problem.clone(),
            },
        }
    }
}

/// A configuration used by an [`OnionRelay`](crate::OnionRelay).
///
/// Build one with [`RelayConfigBuilder`], or load one from TOML files with
/// [`ConfigSources`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct RelayConfig {
    /// Identity and listening addresses.
    pub relay: RelaySection,
    /// Timeouts for channels and streams.
    pub channel: ChannelConfig,
    /// Process-wide settings.
    pub system: SystemConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Return a new builder for a `RelayConfig`.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }
}

/// Builder for a [`RelayConfig`].
///
/// Every section is optional when deserializing; only `relay.agent_id` has
/// no default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfigBuilder {
    /// See [`RelayConfig::relay`].
    relay: RelaySectionBuilder,
    /// See [`RelayConfig::channel`].
    channel: ChannelConfigBuilder,
    /// See [`RelayConfig::system`].
    system: SystemConfigBuilder,
    /// See [`RelayConfig::logging`].
    logging: LoggingConfigBuilder,
}

impl RelayConfigBuilder {
    /// Return a mutable reference to the `[relay]` section builder.
    pub fn relay(&mut self) -> &mut RelaySectionBuilder {
        &mut self.relay
    }
    /// Return a mutable reference to the `[channel]` section builder.
    pub fn channel(&mut self) -> &mut ChannelConfigBuilder {
        &mut self.channel
    }
    /// Return a mutable reference to the `[system]` section builder.
    pub fn system(&mut self) -> &mut SystemConfigBuilder {
        &mut self.system
    }
    /// Return a mutable reference to the `[logging]` section builder.
    pub fn logging(&mut self) -> &mut LoggingConfigBuilder {
        &mut self.logging
    }

    /// Try to construct a [`RelayConfig`].
    pub fn build(&self) -> Result<RelayConfig, ConfigBuildError> {
        Ok(RelayConfig {
            relay: self.relay.build().map_err(|e| e.within("relay"))?,
            channel: self.channel.build().map_err(|e| e.within("channel"))?,
            system: self.system.build().map_err(|e| e.within("system"))?,
            logging: self.logging.build().map_err(|e| e.within("logging"))?,
        })
    }
}

/// The `[relay]` section: who this relay is and where it listens.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[non_exhaustive]
pub struct RelaySection {
    /// The agent ID this relay answers to in the `open` handshake.
    pub agent_id: u32,

    /// Addresses to accept channels on.
    #[builder(default)]
    pub listen: Listen,
}

/// The `[channel]` section: how long to wait on the network.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[non_exhaustive]
pub struct ChannelConfig {
    /// How long to wait for a TCP connection to a destination or to the
    /// next hop of a circuit.
    #[builder(default = "Duration::from_secs(10)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub connect_timeout: Duration,

    /// How long to wait for `opened` or `created` from the next hop.
    #[builder(default = "Duration::from_secs(10)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub handshake_timeout: Duration,

    /// How long a channel may go without sending a complete cell before we
    /// treat it as dead.
    #[builder(default = "Duration::from_secs(10 * 60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub idle_timeout: Duration,
}

impl ChannelConfigBuilder {
    /// Check that no timeout is zero.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        let fields = [
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("idle_timeout", self.idle_timeout),
        ];
        for (field, value) in fields {
            if value == Some(Duration::ZERO) {
                return Err(ConfigBuildError::Invalid {
                    field: field.to_string(),
                    problem: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The `[system]` section.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[non_exhaustive]
pub struct SystemConfig {
    /// How long to wait for the relay's tasks to finish once it is asked to
    /// stop.
    #[builder(default = "Duration::from_secs(20)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub shutdown_timeout: Duration,
}

/// Logging configuration options.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[non_exhaustive]
pub struct LoggingConfig {
    /// Filtering directives that determine tracing levels as described at
    /// <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#impl-FromStr-for-Targets>
    ///
    /// You can override this setting with the `-l`, `--log-level` command line parameter.
    ///
    /// Example: "info,onion_relay::handler=debug"
    #[builder(default = "DEFAULT_LOG_LEVEL.as_str().to_ascii_lowercase()", setter(into))]
    pub console: String,
}

impl LoggingConfigBuilder {
    /// Check that the console filter parses.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        if let Some(console) = &self.console {
            EnvFilter::builder()
                .parse(console)
                .map_err(|e| ConfigBuildError::Invalid {
                    field: "console".to_string(),
                    problem: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// A `ProjectDirs` object for onion relays.
fn project_dirs() -> Option<&'static ProjectDirs> {
    /// lazy cell holding the ProjectDirs object.
    static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
        Lazy::new(|| ProjectDirs::from("", "", "onion-relay"));

    PROJECT_DIRS.as_ref()
}

/// Paths used for default configuration files.
///
/// Empty if we can't find the user's configuration directory.
pub fn default_config_files() -> Vec<PathBuf> {
    project_dirs()
        .map(|dirs| {
            let dir = dirs.config_dir();
            vec![dir.join("onion-relay.toml"), dir.join("onion-relay.d")]
        })
        .unwrap_or_default()
}

/// Whether a configuration source must exist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MustRead {
    /// It is fine for this file or directory to be missing.
    TolerateAbsence,
    /// This file or directory was named explicitly; it must be readable.
    MustRead,
}

/// A list of configuration files and command-line overrides to load a
/// [`RelayConfig`] from.
///
/// Later sources take precedence over earlier ones; command-line options
/// take precedence over all files.
#[derive(Clone, Debug, Default)]
pub struct ConfigSources {
    /// Files and directories to read, in order.
    files: Vec<(PathBuf, MustRead)>,
    /// `key=value` overrides, in TOML syntax.
    options: Vec<String>,
}

impl ConfigSources {
    /// Create an empty set of sources.
    pub fn new_empty() -> Self {
        Self::default()
    }

    /// Create sources from the command line.
    ///
    /// If `files` is empty, the `default_files` are read if they exist.
    pub fn from_cmdline<F, O>(default_files: &[PathBuf], files: F, options: O) -> Self
    where
        F: IntoIterator,
        F::Item: Into<OsString>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        let mut sources = Self::new_empty();
        let files: Vec<PathBuf> = files
            .into_iter()
            .map(|f| PathBuf::from(f.into()))
            .collect();
        if files.is_empty() {
            for f in default_files {
                sources.push_file(f, MustRead::TolerateAbsence);
            }
        } else {
            for f in files {
                sources.push_file(f, MustRead::MustRead);
            }
        }
        for opt in options {
            sources.push_option(opt);
        }
        sources
    }

    /// Add a file or directory (of `*.toml` files) which must exist.
    pub fn push_required_file(&mut self, path: impl Into<PathBuf>) {
        self.push_file(path, MustRead::MustRead);
    }

    /// Add a `key=value` override.
    pub fn push_option(&mut self, option: impl Into<String>) {
        self.options.push(option.into());
    }

    /// Add a file or directory.
    fn push_file(&mut self, path: impl Into<PathBuf>, must_read: MustRead) {
        self.files.push((path.into(), must_read));
    }

    /// Read every source and merge them into a single TOML table.
    pub fn load(&self) -> anyhow::Result<toml::Table> {
        let mut merged = toml::Table::new();
        for (path, must_read) in &self.files {
            for file in expand_config_path(path, *must_read)? {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let table: toml::Table = toml::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", file.display()))?;
                merge_tables(&mut merged, table);
            }
        }
        for opt in &self.options {
            let table: toml::Table = toml::from_str(opt)
                .with_context(|| format!("Failed to parse command-line option {:?}", opt))?;
            merge_tables(&mut merged, table);
        }
        Ok(merged)
    }

    /// Read every source and build a [`RelayConfig`] from the result.
    pub fn resolve(&self) -> anyhow::Result<RelayConfig> {
        resolve(self.load()?)
    }
}

/// Build a [`RelayConfig`] from a merged TOML table.
pub fn resolve(table: toml::Table) -> anyhow::Result<RelayConfig> {
    let builder: RelayConfigBuilder = toml::Value::Table(table)
        .try_into()
        .context("Invalid configuration")?;
    Ok(builder.build()?)
}

/// Turn a configured path into the list of files it names.
///
/// A directory names every `*.toml` file directly inside it, in
/// lexical order.
fn expand_config_path(path: &Path, must_read: MustRead) -> anyhow::Result<Vec<PathBuf>> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && must_read == MustRead::TolerateAbsence => {
            return Ok(vec![]);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to access {}", path.display()));
        }
    };
    if !meta.is_dir() {
        return Ok(vec![path.to_owned()]);
    }
    let mut files = vec![];
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to list directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("Failed to list directory {}", path.display()))?;
        let file = entry.path();
        if file.extension().is_some_and(|ext| ext == "toml") {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

/// Merge `from` into `into`, recursing into tables.
///
/// Values in `from` replace values in `into`, except that two tables under the
/// same key are merged.
fn merge_tables(into: &mut toml::Table, from: toml::Table) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(new)) => {
                merge_tables(existing, new);
            }
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
}
