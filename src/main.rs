//! # tabletalk command line
//!
//! ```text
//! tabletalk analyze sales.csv
//! tabletalk ask sales.csv "is price correlated with quantity?"
//! tabletalk memory show
//! ```
//!
//! Results are printed on stdout, logs on stderr and in the log directory.

#![warn(clippy::all, rust_2018_idioms)]
#![expect(clippy::print_stdout)] // Results go to stdout

mod cli;

use anyhow::Result;
use clap::Parser as _;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    if let Err(e) = tabletalk::logging::init() {
        tabletalk::logging::init_console()?;
        tracing::warn!("File logging is unavailable, logging to the console only: {e:#}");
    }

    tokio::runtime::Runtime::new()?.block_on(cli::run(cli))
}
