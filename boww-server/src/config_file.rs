//! YAML configuration: loading and hot-reload.
//!
//! Two top-level keys:
//!
//! ```yaml
//! groups:
//!   - name: kitchen
//!     arbitration_timeout_ms: 200
//!     vad_no_voice_ms: 1000
//!     output: alsa
//!     device: "plughw:1,0"
//! clients:
//!   - guid: g-1
//!     group: kitchen
//!     onboard_temp_id: temp-0A1B2C3D   # optional, fires onboarding once
//! ```
//!
//! The watcher polls the file's modification time every 2 seconds; any
//! advance triggers a reparse. A parse failure leaves the previously
//! applied state intact.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, info, warn};

use boww_core::error::{BowwError, Result};
use boww_core::{ClientEntry, ConfigView, GroupConfig};

use crate::server::Server;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    groups: Vec<GroupConfig>,
    #[serde(default)]
    clients: Vec<ClientEntry>,
}

/// Parse the YAML config at `path` into a read-only view.
pub fn load(path: &Path) -> Result<ConfigView> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: ConfigFile =
        serde_yaml::from_str(&raw).map_err(|e| BowwError::InvalidConfig(e.to_string()))?;
    Ok(ConfigView::new(parsed.groups, parsed.clients))
}

/// Applies config views to the server and re-checks the file on a 2 s
/// cadence. Onboarding pairings fire exactly once per observed
/// (temp-id, guid) pair, not on every poll that still sees them.
pub struct ConfigWatcher {
    path: PathBuf,
    server: Arc<Server>,
    fired_onboardings: HashSet<(String, String)>,
}

impl ConfigWatcher {
    pub fn new(path: impl AsRef<Path>, server: Arc<Server>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            server,
            fired_onboardings: HashSet::new(),
        }
    }

    /// Push a parsed view into the server and fire new onboardings.
    pub fn apply(&mut self, view: &ConfigView) {
        self.server.apply_config(view);

        for client in view.clients() {
            if let Some(temp_id) = &client.onboard_temp_id {
                let key = (temp_id.clone(), client.guid.clone());
                if self.fired_onboardings.insert(key) {
                    info!(
                        temp_id = temp_id.as_str(),
                        guid = client.guid.as_str(),
                        "onboarding pairing observed"
                    );
                    self.server.onboard(temp_id, &client.guid);
                }
            }
        }
    }

    /// Poll loop; runs until `running` clears.
    pub fn spawn(mut self, running: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            let mut last_modified = modified(&self.path);

            while running.load(Ordering::Relaxed) {
                std::thread::sleep(POLL_INTERVAL);

                let current = modified(&self.path);
                let advanced = match (last_modified, current) {
                    (Some(last), Some(now)) => now > last,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if !advanced {
                    continue;
                }

                match load(&self.path) {
                    Ok(view) => {
                        info!(
                            groups = view.group_count(),
                            clients = view.client_count(),
                            "configuration reloaded"
                        );
                        self.apply(&view);
                        last_modified = current;
                    }
                    Err(e) => {
                        warn!("config reload failed, keeping previous state: {e}");
                    }
                }
            }
            debug!("config watcher stopped");
        })
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use boww_core::{DisabledVad, OutputKind, ServerMessage};
    use std::io::Write;
    use tokio::sync::mpsc;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("clients.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn full_config_parses_with_defaults_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
groups:
  - name: kitchen
    output: alsa
    device: "plughw:1,0"
    arbitration_timeout_ms: 300
  - name: attic
clients:
  - guid: g-1
    group: kitchen
  - guid: g-2
    group: attic
    onboard_temp_id: temp-0A1B2C3D
"#,
        );

        let view = load(&path).unwrap();
        assert_eq!(view.group_count(), 2);
        assert_eq!(view.client_count(), 2);

        let kitchen = view.group("kitchen").unwrap();
        assert_eq!(kitchen.output, OutputKind::Device);
        assert_eq!(kitchen.device.as_deref(), Some("plughw:1,0"));
        assert_eq!(kitchen.arbitration_timeout_ms, 300);
        assert_eq!(kitchen.vad_no_voice_ms, 1_000);

        let attic = view.group("attic").unwrap();
        assert_eq!(attic.output, OutputKind::File);
        assert_eq!(attic.sample_rate, 16_000);
        assert_eq!(attic.channels, 1);

        assert_eq!(
            view.client("g-2").unwrap().onboard_temp_id.as_deref(),
            Some("temp-0A1B2C3D")
        );
    }

    #[test]
    fn empty_and_partial_documents_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "groups: []\n");
        let view = load(&path).unwrap();
        assert_eq!(view.group_count(), 0);
        assert_eq!(view.client_count(), 0);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "groups: [ {name: ");
        assert!(load(&path).is_err());

        let missing = dir.path().join("nope.yaml");
        assert!(load(&missing).is_err());
    }

    #[test]
    fn onboarding_fires_once_per_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(
            Server::new(Arc::new(DisabledVad))
                .with_dirs(dir.path().join("log.txt"), dir.path().join("wav")),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = server.register(tx);
        let temp_id = session.temp_id().unwrap();

        let view = ConfigView::new(
            vec![GroupConfig::named("kitchen")],
            vec![ClientEntry {
                guid: "g-9".into(),
                group: "kitchen".into(),
                onboard_temp_id: Some(temp_id.clone()),
            }],
        );

        let mut watcher = ConfigWatcher::new(dir.path().join("clients.yaml"), Arc::clone(&server));
        watcher.apply(&view);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::AssignId { id: "g-9".into() }
        );

        // The pairing is still in the file on the next poll: no re-fire.
        watcher.apply(&view);
        assert!(rx.try_recv().is_err());

        // A different GUID for the same temp-id is a new pairing.
        let view2 = ConfigView::new(
            vec![],
            vec![ClientEntry {
                guid: "g-10".into(),
                group: "kitchen".into(),
                onboard_temp_id: Some(temp_id),
            }],
        );
        watcher.apply(&view2);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::AssignId { id: "g-10".into() }
        );
    }
}
