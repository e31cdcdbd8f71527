//! Command-line arguments of the `onion-relay` binary.

use std::ffi::OsString;

use clap::{Args, Parser, Subcommand, ValueEnum};
use onion_relay::config::{default_config_files, ConfigSources};

/// A relay node for a small onion-routing overlay.
#[derive(Clone, Debug, Parser)]
#[command(author = "The onion-relay developers")]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,

    #[clap(flatten)]
    pub(crate) global: GlobalArgs,
}

/// Arguments accepted before or after the subcommand.
#[derive(Clone, Debug, Args)]
pub(crate) struct GlobalArgs {
    /// Override the log level from the configuration.
    #[arg(long, short, global = true)]
    #[arg(value_name = "LEVEL")]
    pub(crate) log_level: Option<LogLevel>,

    /// Override config file parameters, using TOML-like syntax.
    #[arg(long = "option", short, global = true)]
    #[arg(value_name = "KEY=VALUE")]
    pub(crate) options: Vec<String>,

    /// Config file(s) or directories to read.
    ///
    /// When none is given, the default files are read if they exist.
    #[arg(long, short, global = true)]
    #[arg(value_name = "FILE")]
    pub(crate) config: Vec<CliOsString>,
}

impl GlobalArgs {
    /// Return the configuration sources named on the command line.
    pub(crate) fn config(&self) -> ConfigSources {
        ConfigSources::from_cmdline(
            &default_config_files(),
            self.config.iter().map(|f| f.0.clone()),
            self.options.iter().cloned(),
        )
    }
}

/// Main subcommands.
#[derive(Clone, Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run the relay until interrupted.
    Run(RunArgs),
    /// Print build information.
    BuildInfo,
}

/// Arguments when running a relay.
#[derive(Clone, Debug, Args)]
pub(crate) struct RunArgs {}

/// Log levels allowed by the cli.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::metadata::Level {
    fn from(x: LogLevel) -> Self {
        match x {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

/// An [`OsString`] wrapper which implements `Display`; designed for use with the cli help text.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::From)]
pub(crate) struct CliOsString(pub(crate) OsString);

impl std::fmt::Display for CliOsString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // we can't (and don't want to) write non-utf-8 bytes in the cli help output
        self.0.to_string_lossy().fmt(f)
    }
}

impl std::str::FromStr for CliOsString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CliOsString(s.into()))
    }
}
