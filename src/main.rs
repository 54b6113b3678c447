use env_logger::{Builder, Env};

use rustcoin::cli::Cli;
use rustcoin::errors::Result;

#[tokio::main]
async fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    Cli::run().await
}
