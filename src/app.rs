use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Backend, Command, LogLevel, RunOptions};
use crate::telemetry;

/// Runs one parsed CLI command, writing reports to `out`.
///
/// Returns whether every executed case passed; the listing commands always
/// return `true`.
///
/// ```
/// # async fn demo() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = certbridge::Args::try_parse_from([
///     "certbridge",
///     "--fake",
///     "run",
///     "--case",
///     "GAP/DISC",
/// ])?;
/// let options = certbridge::RunOptions::builder()
///     .maybe_log_level(args.log_level())
///     .build();
/// let (command, backend) = args.into_command_and_backend();
/// let mut out = Vec::new();
/// let all_passed = certbridge::run(command, &mut out, backend, options).await?;
/// # let _ = all_passed;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the backend is
/// misconfigured, or output writing fails.
#[instrument(skip(out, backend, options), fields(command = %command_name(&command)))]
pub async fn run<W>(
    command: Command,
    out: &mut W,
    backend: Backend,
    options: RunOptions,
) -> Result<bool>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "certbridge",
        options.interactive,
        options.log_level.map(LogLevel::as_level_filter),
    )?;

    match command {
        Command::Run(args) => crate::cli::run::run(args, backend, options, out).await,
        Command::Catalog(args) => {
            crate::cli::catalog::run(&args, options, out)?;
            Ok(true)
        }
        Command::Pixit(args) => {
            crate::cli::catalog::run_pixit(&args, options, out)?;
            Ok(true)
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Run(_args) => "run",
        Command::Catalog(_args) => "catalog",
        Command::Pixit(_args) => "pixit",
    }
}
