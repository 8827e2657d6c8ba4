use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use logid_hidpp::monitor::DeviceMonitor;
use tracing::info;

use super::{Cli, create_context};
use crate::{config::Config, configurator::Configurator, hotplug};

/// Manage devices and apply the configured settings until interrupted.
#[derive(Args)]
pub struct RunCommand {}

impl RunCommand {
    pub async fn execute(&self, _root: &Cli, config: Config) -> Result<()> {
        let config = Arc::new(config);
        let context = create_context(&config)?;
        let monitor = DeviceMonitor::new(context, Arc::new(Configurator::new(Arc::clone(&config))));

        let _watcher = hotplug::watch(&monitor)?;
        let count = hotplug::scan(&monitor)?;
        info!(nodes = count, "watching for devices");

        tokio::signal::ctrl_c()
            .await
            .context("could not wait for the interrupt signal")?;

        info!("shutting down");
        for path in hotplug::nodes()? {
            monitor.device_removed(path);
        }

        Ok(())
    }
}
