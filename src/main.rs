// ABOUTME: Binary entry point for the trailhead CLI
// ABOUTME: Parses arguments, loads configuration and hands control to the application

use anyhow::Result;
use trailhead::cli::{App, Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    let config = Config::load(args.config.clone())?;

    App::new(config).run(args).await
}
