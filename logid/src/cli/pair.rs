use std::{
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, bail};
use clap::Args;
use logid_hidpp::{
    channel::RawChannel,
    device::Device,
    listener::DeviceListener,
    receiver::{Receiver, pairing::PairingOutcome},
};
use owo_colors::OwoColorize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Cli, create_context};
use crate::config::Config;

/// Pair a new device with a receiver.
#[derive(Args)]
pub struct PairCommand {
    /// The hidraw node of the receiver
    path: PathBuf,

    /// Seconds the receiver stays open for new devices
    #[arg(short, long, default_value_t = 30)]
    timeout: u8,
}

#[derive(Debug)]
enum PairingMessage {
    Passkey(String),
    Added { index: u8, name: String },
    Finished(PairingOutcome),
}

/// Forwards pairing progress from the reader thread into the async command.
struct PairingListener {
    tx: mpsc::UnboundedSender<PairingMessage>,
}

impl DeviceListener for PairingListener {
    fn device_added(&self, device: &Arc<Device>) {
        let _ = self.tx.send(PairingMessage::Added {
            index: device.device_index(),
            name: device.name(),
        });
    }

    fn pairing_passkey(&self, _receiver: &Receiver, passkey: &str) {
        let _ = self.tx.send(PairingMessage::Passkey(passkey.to_string()));
    }

    fn pairing_finished(&self, _receiver: &Receiver, outcome: PairingOutcome) {
        let _ = self.tx.send(PairingMessage::Finished(outcome));
    }
}

impl PairCommand {
    pub async fn execute(&self, root: &Cli, config: Config) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let context = create_context(&config)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Arc::new(PairingListener { tx });

        let path = self.path.clone();
        let timeout = self.timeout;
        let receiver = tokio::task::spawn_blocking(move || -> Result<Arc<Receiver>> {
            let channel = RawChannel::open(&path)?;
            let receiver = Receiver::new(&context, channel, listener)?;
            receiver.start()?;
            receiver.start_pair(timeout)?;
            Ok(receiver)
        })
        .await??;

        if !root.json {
            writeln!(
                stdout,
                "{}",
                "Waiting for a device, turn it on or put it into pairing mode.".bright_black()
            )?;
            stdout.flush()?;
        }

        let deadline = tokio::time::sleep(Duration::from_secs(u64::from(self.timeout) + 5));
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(PairingMessage::Passkey(passkey)) => {
                        if root.json {
                            writeln!(stdout, "{}", json!({ "passkey": passkey }))?;
                        } else {
                            writeln!(stdout, "Type {} on the device and press enter.", passkey.bold().blue())?;
                        }
                        stdout.flush()?;
                    },
                    // Children paired earlier announce themselves after start.
                    Some(PairingMessage::Added { .. }) => {},
                    Some(PairingMessage::Finished(outcome)) => break Some(outcome),
                    None => break None,
                },
                _ = &mut deadline => break None,
                _ = tokio::signal::ctrl_c() => break None,
            }
        };

        let Some(outcome) = outcome else {
            let receiver = Arc::clone(&receiver);
            if let Err(err) = tokio::task::spawn_blocking(move || receiver.stop_pair()).await? {
                warn!(%err, "could not stop pairing");
            }
            bail!("pairing was cancelled or timed out");
        };

        // The new device connects shortly after pairing completed.
        let mut added = None;
        if outcome.is_success() {
            tokio::time::sleep(config.options.io_timeout() * 2).await;
            while let Ok(message) = rx.try_recv() {
                if let PairingMessage::Added { index, name } = message
                    && Some(index) == outcome.slot
                {
                    added = Some(name);
                }
            }
        }

        if root.json {
            writeln!(
                stdout,
                "{}",
                json!({
                    "success": outcome.is_success(),
                    "error": outcome.error,
                    "slot": outcome.slot,
                    "name": added,
                })
            )?;
        } else if outcome.is_success() {
            writeln!(
                stdout,
                "{} in slot {}",
                "Paired".green(),
                outcome.slot.map_or("?".to_string(), |slot| slot.to_string()).bright_blue()
            )?;
            if let Some(name) = &added {
                writeln!(stdout, " ╰─ {name}")?;
            }
        } else {
            writeln!(
                stdout,
                "{} (error {:#04x})",
                "Pairing failed".red(),
                outcome.error.unwrap_or_default()
            )?;
        }

        stdout.flush()?;
        receiver.close();

        Ok(())
    }
}
