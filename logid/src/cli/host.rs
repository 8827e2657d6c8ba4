use std::{
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Result, bail};
use clap::Args;
use logid_hidpp::{
    device::Device,
    feature::change_host::{ChangeHost, HostInfo},
    report::DEFAULT_DEVICE_INDEX,
};
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, create_context};
use crate::config::Config;

/// Switch a multi-host device to another host.
#[derive(Args)]
pub struct HostCommand {
    /// The hidraw node the device is reachable through
    path: PathBuf,

    /// The device index, the slot number for devices behind a receiver
    #[arg(short, long, default_value_t = DEFAULT_DEVICE_INDEX)]
    index: u8,

    /// The host to switch to, starting at 1. Omit to show the current one.
    host: Option<u8>,
}

impl HostCommand {
    pub async fn execute(&self, root: &Cli, config: Config) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let context = create_context(&config)?;
        let path = self.path.clone();
        let index = self.index;
        let target = match self.host {
            Some(0) => bail!("hosts are numbered starting at 1"),
            Some(host) => Some(host - 1),
            None => None,
        };

        let (before, name) = tokio::task::spawn_blocking(move || -> Result<(HostInfo, String)> {
            let device = Device::open(&context, &path, index)?;
            let feature = device.get_feature::<ChangeHost>()?;
            let info = feature.host_info()?;

            if let Some(host) = target {
                feature.set_host(host)?;
            }

            let name = device.name();
            device.close();
            Ok((info, name))
        })
        .await??;

        if root.json {
            writeln!(
                stdout,
                "{}",
                json!({
                    "name": name,
                    "host_count": before.host_count,
                    "current_host": before.current_host,
                    "switched_to": target,
                })
            )?;
        } else {
            writeln!(
                stdout,
                "{}: host {} of {}",
                name,
                (before.current_host + 1).bright_blue(),
                before.host_count.bright_black()
            )?;
            if let Some(host) = target.filter(|&host| host != before.current_host) {
                writeln!(stdout, " ╰─ switched to host {}", (host + 1).green())?;
            }
        }

        stdout.flush()?;

        Ok(())
    }
}
