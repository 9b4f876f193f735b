// Agentlink - main entry point

use std::process::ExitCode;

use clap::Parser;

use agentlink::cli::{self, Cli};
use agentlink::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(cli.verbose);

    match cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
