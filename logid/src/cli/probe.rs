use std::{
    io::{BufWriter, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use clap::Args;
use itertools::Itertools;
use logid_hidpp::{
    device::{Device, DeviceState},
    feature::{
        self,
        FeatureError,
        adjustable_dpi::{AdjustableDpi, SensorDpi},
        change_host::{ChangeHost, HostInfo},
        device_name::{DeviceName, DeviceType},
        smartshift::{SmartShift, SmartShiftStatus},
    },
    listener::NoopListener,
    monitor::{DeviceMonitor, Managed},
    receiver::{Receiver, ReceiverKind},
};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, create_context};
use crate::{config::Config, hotplug};

/// How long to poll for nodes still being probed.
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Detect and view general information about connected devices.
#[derive(Args)]
pub struct ProbeCommand {}

impl ProbeCommand {
    pub async fn execute(&self, root: &Cli, config: Config) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let context = create_context(&config)?;
        let settle = context.options().io_timeout() * 2;
        let monitor = DeviceMonitor::new(context, Arc::new(NoopListener));
        hotplug::scan(&monitor)?;

        let deadline = Instant::now() + PROBE_DEADLINE;
        while monitor.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        // Receivers announce their children asynchronously after starting.
        tokio::time::sleep(settle).await;

        let nodes = tokio::task::spawn_blocking(move || probe_nodes(&monitor)).await??;

        if root.json {
            writeln!(stdout, "{}", json!(nodes))?;
            return Ok(());
        }

        if nodes.is_empty() {
            writeln!(stdout, "{}", "No HID++ devices were found.".bright_black())?;
            stdout.flush()?;
            return Ok(());
        }

        for (node_i, node) in nodes.into_iter().enumerate() {
            if node_i != 0 {
                writeln!(stdout)?;
            }

            writeln!(
                stdout,
                "{}: {} ({:#06x})",
                node.path.bright_black(),
                match node.receiver {
                    Some(kind) => format!("{kind:?} receiver"),
                    None => "Device".to_string(),
                },
                node.product_id.bright_black()
            )?;
            writeln!(stdout, " │")?;

            if node.devices.is_empty() {
                writeln!(
                    stdout,
                    " ╰─ {}",
                    "No devices were found.".bright_black().italic()
                )?;
                continue;
            }

            let devices_len = node.devices.len();
            for (device_i, device) in node.devices.into_iter().enumerate() {
                if device_i != 0 {
                    writeln!(stdout, " │")?;
                }

                let online = device.state == DeviceState::Ready;
                writeln!(
                    stdout,
                    "{} {}: {} {} (HID++{}) ({:#06x})",
                    if device_i == devices_len - 1 {
                        " ╰─"
                    } else {
                        " ├─"
                    },
                    format!("{:#04x}", device.index).bright_blue(),
                    if online {
                        "●".green().into_styled()
                    } else {
                        "●".red().into_styled()
                    },
                    if online {
                        device.name
                    } else {
                        device.name.bright_black().italic().to_string()
                    },
                    device.version.green(),
                    device.product_id.bright_black(),
                )?;

                let properties = device.properties.lines();
                let properties_len = properties.len();
                for (property_i, property) in properties.into_iter().enumerate() {
                    writeln!(
                        stdout,
                        "{}{} {}",
                        if device_i == devices_len - 1 {
                            "         "
                        } else {
                            " │       "
                        },
                        if property_i == properties_len - 1 {
                            "╰─"
                        } else {
                            "├─"
                        },
                        property
                    )?;
                }
            }
        }

        stdout.flush()?;

        Ok(())
    }
}

fn probe_nodes(monitor: &DeviceMonitor) -> Result<Vec<ProbedNode>> {
    monitor
        .managed()
        .into_iter()
        .map(|managed| match managed {
            Managed::Receiver(receiver) => probe_receiver(&receiver),
            Managed::Device(device) => {
                let info = device.channel().info();
                Ok(ProbedNode {
                    path: info.path.display().to_string(),
                    product_id: info.product_id,
                    receiver: None,
                    devices: vec![probe_device(&device)?],
                })
            },
        })
        .collect::<Result<Vec<_>>>()
        .map(|nodes| nodes.into_iter().sorted_by(|a, b| a.path.cmp(&b.path)).collect())
}

fn probe_receiver(receiver: &Receiver) -> Result<ProbedNode> {
    let info = receiver.device().channel().info();

    Ok(ProbedNode {
        path: info.path.display().to_string(),
        product_id: info.product_id,
        receiver: Some(receiver.kind()),
        devices: receiver
            .children()
            .iter()
            .map(|device| probe_device(device))
            .collect::<Result<_>>()?,
    })
}

fn probe_device(device: &Arc<Device>) -> Result<ProbedDevice> {
    let state = device.state();
    let properties = if state == DeviceState::Ready && device.version().is_v20() {
        probe_properties(device)?
    } else {
        ProbedDeviceProperties::default()
    };

    Ok(ProbedDevice {
        index: device.device_index(),
        name: device.name(),
        product_id: device.product_id(),
        version: device.version().to_string(),
        state,
        properties,
    })
}

fn probe_properties(device: &Arc<Device>) -> Result<ProbedDeviceProperties> {
    let mut properties = ProbedDeviceProperties::default();

    if let Some(feature) = feature::attach::<DeviceName>(device) {
        properties.kind.replace(feature.device_type()?);
    }

    if let Some(feature) = feature::attach::<AdjustableDpi>(device) {
        properties.dpi.replace(feature.dpi(0)?);
    }

    match SmartShift::attach_any(device) {
        Ok(feature) => {
            properties.smartshift.replace(feature.status()?);
        },
        Err(FeatureError::Unsupported(_)) => {},
        Err(err) => return Err(err.into()),
    }

    if let Some(feature) = feature::attach::<ChangeHost>(device) {
        properties.host.replace(feature.host_info()?);
    }

    Ok(properties)
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedNode {
    path: String,
    product_id: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    receiver: Option<ReceiverKind>,

    devices: Vec<ProbedDevice>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedDevice {
    index: u8,
    name: String,
    product_id: u16,
    version: String,
    state: DeviceState,
    properties: ProbedDeviceProperties,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
struct ProbedDeviceProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<DeviceType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    dpi: Option<SensorDpi>,

    #[serde(skip_serializing_if = "Option::is_none")]
    smartshift: Option<SmartShiftStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<HostInfo>,
}

impl ProbedDeviceProperties {
    fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(kind) = self.kind {
            lines.push(format!("TYPE: {:?}", kind.bright_black()));
        }
        if let Some(dpi) = self.dpi {
            lines.push(format!(
                "DPI: {} (default {})",
                dpi.current.blue(),
                dpi.default.bright_black()
            ));
        }
        if let Some(smartshift) = self.smartshift {
            lines.push(format!(
                "SMARTSHIFT: {:?}, disengages at {}",
                smartshift.wheel_mode.green(),
                smartshift.auto_disengage.bright_black()
            ));
        }
        if let Some(host) = self.host {
            lines.push(format!(
                "HOST: {} of {}",
                (host.current_host + 1).blue(),
                host.host_count.bright_black()
            ));
        }

        lines
    }
}
