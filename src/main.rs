//! Command-line entrypoint: races the candidate models configured via
//! environment variables against each other for one query and prints the
//! winner's answer.
use eyre::Result;

pub mod cli;
pub mod display;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
