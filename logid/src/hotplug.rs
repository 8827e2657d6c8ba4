//! Feeds hidraw nodes appearing in and vanishing from `/dev` into a
//! [`DeviceMonitor`].

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use itertools::Itertools;
use logid_hidpp::monitor::DeviceMonitor;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

const DEV_DIR: &str = "/dev";

/// Whether `path` names a hidraw node.
pub fn is_hidraw(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("hidraw"))
        .is_some_and(|number| !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()))
}

/// Lists the hidraw nodes currently present, sorted by path.
pub fn nodes() -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(DEV_DIR).with_context(|| format!("could not list {DEV_DIR}"))?;

    Ok(entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| is_hidraw(path))
        .sorted()
        .collect())
}

/// Hands every present hidraw node to the monitor.
pub fn scan(monitor: &Arc<DeviceMonitor>) -> Result<usize> {
    let nodes = nodes()?;
    let count = nodes.len();

    for path in nodes {
        monitor.device_added(path);
    }

    Ok(count)
}

/// Watches `/dev` for hidraw nodes. Stops when the returned watcher is dropped.
pub fn watch(monitor: &Arc<DeviceMonitor>) -> Result<RecommendedWatcher> {
    let monitor = Arc::downgrade(monitor);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "hotplug watcher failed");
                return;
            },
        };

        let Some(monitor) = monitor.upgrade() else {
            return;
        };

        for path in event.paths.iter().filter(|path| is_hidraw(path)) {
            match event.kind {
                EventKind::Create(_) => {
                    debug!(path = %path.display(), "hidraw node appeared");
                    monitor.device_added(path.clone());
                },
                EventKind::Remove(_) => {
                    debug!(path = %path.display(), "hidraw node vanished");
                    monitor.device_removed(path);
                },
                _ => {},
            }
        }
    })?;

    watcher
        .watch(Path::new(DEV_DIR), RecursiveMode::NonRecursive)
        .with_context(|| format!("could not watch {DEV_DIR}"))?;

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_hidraw_nodes() {
        assert!(is_hidraw(Path::new("/dev/hidraw0")));
        assert!(is_hidraw(Path::new("/dev/hidraw12")));

        assert!(!is_hidraw(Path::new("/dev/hidraw")));
        assert!(!is_hidraw(Path::new("/dev/hidrawx")));
        assert!(!is_hidraw(Path::new("/dev/hiddev0")));
        assert!(!is_hidraw(Path::new("/dev/input/event3")));
    }
}
