//! inboxmirror CLI: mirror a chat inbox into a local database.
//!
//! Runs the operator API, triggers one-off crawls, and inspects or triages
//! the mirrored conversations.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
