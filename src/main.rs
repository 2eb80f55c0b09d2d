use clap::Parser;
use skylog::app;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = app::Cli::parse();
    match app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("skylog: {err:#}");
            ExitCode::FAILURE
        }
    }
}
