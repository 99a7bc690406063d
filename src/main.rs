use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use certbridge::{Args, OutputFormat, RunOptions, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();
    let interactive = stdout.is_terminal();

    let run_result = async {
        let format = args.output_format().unwrap_or(if interactive {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        });
        let options = RunOptions::builder()
            .maybe_command_timeout(args.timeout())
            .maybe_log_level(args.log_level())
            .format(format)
            .interactive(interactive)
            .build();
        let (command, backend) = args.into_command_and_backend();

        run(command, &mut stdout, backend, options).await
    }
    .await;

    match run_result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
