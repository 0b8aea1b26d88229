mod cmd;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "coderun", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config and verify host isolation prerequisites
    Check(cmd::CheckArgs),
    /// Execute one program and print the JSON response
    Run(cmd::RunArgs),
    /// Serve JSON-lines run requests from stdin until EOF or SIGTERM
    Serve(cmd::ServeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Check(args) => cmd::run_check(args).await.map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_run(args).await,
        Command::Serve(args) => cmd::run_serve(args).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
