use anyhow::Result;

mod cli;
mod config;
mod configurator;
mod hotplug;

#[tokio::main]
async fn main() -> Result<()> {
    cli::execute().await
}
