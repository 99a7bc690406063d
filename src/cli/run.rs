use std::io;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::command::{Backend, OutputFormat, RunArgs, RunOptions};
use crate::cli::ui::{Painter, RunReportView};
use crate::client::ClientConfig;
use crate::error::CliConfigError;
use crate::executor::{Executor, RunReport, TestCase, catalog};
use crate::session::{FakeSessionFactory, SessionFactory, TcpSessionFactory};
use crate::synch::{DEFAULT_ARRIVAL_DEADLINE, Rendezvous};

/// Executes the `run` command. Returns whether every executed case passed.
pub(crate) async fn run<W>(
    args: RunArgs,
    backend: Backend,
    options: RunOptions,
    out: &mut W,
) -> Result<bool>
where
    W: io::Write,
{
    let cancel = CancellationToken::new();
    spawn_interrupt_watcher(cancel.clone());

    let synch = Rendezvous::new(DEFAULT_ARRIVAL_DEADLINE, cancel.clone());
    let client_config = client_config(&options, cancel.clone());
    let factory: Arc<dyn SessionFactory> = match backend {
        Backend::Fake(fake) => Arc::new(FakeSessionFactory::new(
            fake.into_iut_config(),
            args.profile(),
            client_config,
            synch,
        )),
        Backend::Tcp(addresses) => {
            if addresses.is_empty() {
                return Err(CliConfigError::MissingAddress.into());
            }
            Arc::new(TcpSessionFactory::new(
                addresses,
                args.profile(),
                client_config,
                synch,
            ))
        }
    };

    let cases = selected_cases(&args);
    if cases.is_empty() {
        writeln!(out, "no catalogued case matches the requested filter")?;
        return Ok(false);
    }

    let executor = Executor::new(factory, cancel);
    let report = executor.run(cases).await;
    render(&report, options, out)?;
    Ok(report.all_passed())
}

/// Cancels the run on the first interrupt; the case in flight still settles
/// its verdict and tears down.
fn spawn_interrupt_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current step then stopping");
            cancel.cancel();
        }
    });
}

fn client_config(options: &RunOptions, cancel: CancellationToken) -> ClientConfig {
    match options.command_timeout {
        Some(deadline) => ClientConfig::builder()
            .command_deadline(deadline)
            .cancel(cancel)
            .build(),
        None => ClientConfig::builder().cancel(cancel).build(),
    }
}

fn selected_cases(args: &RunArgs) -> Vec<TestCase> {
    let mut cases = catalog();
    cases.retain(|case| case.profile == args.profile());
    if let Some(prefix) = args.case() {
        cases.retain(|case| case.id.starts_with(prefix));
    }
    cases
}

fn render<W>(report: &RunReport, options: RunOptions, out: &mut W) -> Result<()>
where
    W: io::Write,
{
    match options.format {
        OutputFormat::Json => {
            for case_report in &report.reports {
                writeln!(out, "{}", serde_json::to_string(case_report)?)?;
            }
            writeln!(out, "{}", serde_json::to_string(&report.summary())?)?;
        }
        OutputFormat::Pretty => {
            let painter = Painter::new(options.interactive);
            write!(out, "{}", RunReportView::new(report, &painter))?;
        }
    }
    Ok(())
}
