use std::sync::Arc;

use certa_api::ca::serial::SerialAllocator;
use certa_common::ids::SerialNumber;
use certa_db::{
    models::{CERT_COUNTER, DbSerialRange, REQUEST_COUNTER},
    storage::Storage,
};
use clap::{Subcommand, ValueEnum};

#[derive(Clone, Copy, ValueEnum)]
pub enum Counter {
    Certificates,
    Requests,
}

impl Counter {
    fn name(self) -> &'static str {
        match self {
            Self::Certificates => CERT_COUNTER,
            Self::Requests => REQUEST_COUNTER,
        }
    }
}

#[derive(Clone, Subcommand)]
pub enum SerialRangeCommand {
    Show {
        counter: Counter,
    },

    /// Replace the range bounds. Refused if numbers already handed out would
    /// be handed out again.
    Reset {
        counter: Counter,

        /// First number, `0x` hex or decimal.
        #[clap(long)]
        start: SerialNumber,

        /// Last number, inclusive.
        #[clap(long)]
        end: SerialNumber,
    },
}

fn print_range(range: &DbSerialRange) {
    println!(
        "{}: {} - {} (next {}, {} left)",
        range.name,
        SerialNumber::new(range.start),
        SerialNumber::new(range.end),
        SerialNumber::new(range.next),
        range.remaining(),
    );
}

pub async fn serial_range(stg: Arc<dyn Storage>, command: SerialRangeCommand) -> anyhow::Result<()> {
    let range = match command {
        SerialRangeCommand::Show { counter } => {
            SerialAllocator::new(stg, counter.name()).range().await?
        }
        SerialRangeCommand::Reset {
            counter,
            start,
            end,
        } => {
            SerialAllocator::new(stg, counter.name())
                .reset_range(start.get(), end.get())
                .await?
        }
    };
    print_range(&range);
    Ok(())
}
