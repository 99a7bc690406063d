use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::client::fake::{FakeIutConfig, FixtureError, FoundFixture, FoundRecord};
use crate::pixit::Profile;

/// Command-line options for the conformance bridge.
#[derive(Debug, Parser)]
#[command(
    name = "certbridge",
    about = "Drive Bluetooth conformance test cases against an IUT control service."
)]
pub struct Args {
    /// Answers cases against an in-process scripted IUT instead of a live
    /// control socket.
    #[arg(long, global = true)]
    fake: bool,
    /// Scripted discovery results in the form
    /// `type|address|rssi|eir_hex;...`, with `-` for empty EIR data.
    #[arg(long, global = true, requires = "fake")]
    fake_found: Option<FoundFixture>,
    /// Passkey the scripted IUT displays while pairing.
    #[arg(long, global = true, requires = "fake")]
    fake_passkey: Option<u32>,
    /// IUT control address (`host:port`). Repeat the flag to give each case
    /// role its own IUT.
    #[arg(long = "address", global = true, conflicts_with = "fake")]
    addresses: Vec<String>,
    /// Reply deadline for control commands (e.g. `250ms`, `20s`).
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Report format. Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputFormat>,
    /// Telemetry log-level override.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use certbridge::{Args, Command, RunArgs};
    ///
    /// let run = Args::new(Command::Run(RunArgs::default()));
    /// let catalog = Args::new(Command::Catalog(Default::default()));
    /// let _ = (run, catalog);
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            fake: false,
            fake_found: None,
            fake_passkey: None,
            addresses: Vec::new(),
            timeout: None,
            format: None,
            log_level: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fixture settings.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs { found, passkey } = fake;
        self.fake = true;
        self.fake_found = found;
        self.fake_passkey = passkey;
        self
    }

    /// Returns the telemetry log-level override.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Returns the explicitly requested report format.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.format
    }

    /// Returns the control-command reply deadline override.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Splits parsed CLI arguments into the command and its backend.
    #[must_use]
    pub fn into_command_and_backend(self) -> (Command, Backend) {
        let Args {
            fake,
            fake_found,
            fake_passkey,
            addresses,
            timeout: _,
            format: _,
            log_level: _,
            command,
        } = self;

        let backend = if fake {
            Backend::Fake(FakeArgs {
                found: fake_found,
                passkey: fake_passkey,
            })
        } else {
            Backend::Tcp(addresses)
        };
        (command, backend)
    }
}

/// Fake backend fixtures for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    /// Devices the scripted IUT reports during discovery.
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    found: Option<FoundFixture>,
    /// Passkey displayed while pairing.
    passkey: Option<u32>,
}

impl FakeArgs {
    pub(crate) fn into_iut_config(self) -> FakeIutConfig {
        let Self { found, passkey } = self;
        let records: Vec<FoundRecord> = found.map(Into::into).unwrap_or_default();
        FakeIutConfig::builder()
            .found(records)
            .maybe_passkey(passkey)
            .build()
    }
}

/// Where the run command's sessions come from.
#[derive(Debug)]
pub enum Backend {
    /// In-process scripted IUT, one per opened role.
    Fake(FakeArgs),
    /// Live IUT control sockets, cycled per opened role.
    Tcp(Vec<String>),
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run catalogued cases against the IUT and report verdicts.
    Run(RunArgs),
    /// List the built-in case catalogue.
    Catalog(CatalogArgs),
    /// Print the PIXIT defaults for a profile.
    Pixit(PixitArgs),
}

/// Arguments for the `run` command.
#[derive(Debug, Default, clap::Args)]
pub struct RunArgs {
    /// Only run cases whose identifier starts with this prefix.
    #[arg(long)]
    case: Option<String>,
    /// Profile whose catalogue applies.
    #[arg(long, default_value = "gap")]
    profile: Option<Profile>,
}

impl RunArgs {
    /// Creates run arguments with an optional case-identifier prefix.
    #[must_use]
    pub fn new(profile: Profile, case: Option<String>) -> Self {
        Self {
            case,
            profile: Some(profile),
        }
    }

    #[must_use]
    pub fn case(&self) -> Option<&str> {
        self.case.as_deref()
    }

    #[must_use]
    pub fn profile(&self) -> Profile {
        self.profile.unwrap_or(Profile::Gap)
    }
}

/// Arguments for the `catalog` command.
#[derive(Debug, Default, clap::Args)]
pub struct CatalogArgs {
    /// Only list cases for this profile.
    #[arg(long)]
    profile: Option<Profile>,
}

impl CatalogArgs {
    #[must_use]
    pub fn new(profile: Option<Profile>) -> Self {
        Self { profile }
    }

    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.profile
    }
}

/// Arguments for the `pixit` command.
#[derive(Debug, Default, clap::Args)]
pub struct PixitArgs {
    /// Profile whose PIXIT defaults to print.
    #[arg(long, default_value = "gap")]
    profile: Option<Profile>,
}

impl PixitArgs {
    #[must_use]
    pub fn new(profile: Profile) -> Self {
        Self {
            profile: Some(profile),
        }
    }

    #[must_use]
    pub fn profile(&self) -> Profile {
        self.profile.unwrap_or(Profile::Gap)
    }
}

/// Telemetry log level for the `--log-level` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Converts the CLI level to a tracing level filter.
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Report rendering format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-oriented tables, coloured on terminals.
    #[default]
    Pretty,
    /// One JSON object per line, summary last.
    Json,
}

/// Options shared by every CLI invocation.
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct RunOptions {
    /// Reply deadline override for control commands.
    pub command_timeout: Option<Duration>,
    /// Telemetry log-level override.
    pub log_level: Option<LogLevel>,
    /// Report rendering format.
    #[builder(default)]
    pub format: OutputFormat,
    /// Styles output for an interactive terminal.
    #[builder(default)]
    pub interactive: bool,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
