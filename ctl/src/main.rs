use std::sync::Arc;

use anyhow::Context as _;
use certa_db::storage::{Storage, mongodb::MongoDBStorage};
use clap::{Parser, Subcommand};

use crate::commands::{ListRequestsParams, SerialRangeCommand};

mod commands;

#[derive(Parser)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(
        short = 'D',
        long,
        env = "CERTA_API_MONGODB_URI",
        default_value = "mongodb://localhost:27017/certa"
    )]
    db_url: String,
}

#[derive(Clone, Subcommand)]
pub enum Command {
    /// Inspect or move a serial number range.
    #[command(name = "serial-range", subcommand)]
    SerialRange(SerialRangeCommand),

    /// List requests in the queue.
    #[command(name = "list-requests")]
    ListRequests(ListRequestsParams),

    /// Print the digest to put in a `[[tokens]]` entry.
    #[command(name = "token-digest")]
    TokenDigest { token: String },
}

async fn connect(db_url: &str) -> anyhow::Result<Arc<dyn Storage>> {
    let stg = MongoDBStorage::new(db_url)
        .await
        .context("Failed to connect to MongoDB")?;
    Ok(Arc::new(stg))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::SerialRange(command) => {
            let stg = connect(&args.db_url).await?;
            commands::serial_range(stg, command)
                .await
                .context("Serial range command failed")
        }
        Command::ListRequests(params) => {
            let stg = connect(&args.db_url).await?;
            commands::list_requests(&*stg, params)
                .await
                .context("Failed to list requests")
        }
        Command::TokenDigest { token } => {
            println!("{}", commands::token_digest(&token));
            Ok(())
        }
    }
}
