//! Server core: session tables, message demux, group dispatch, ticker.
//!
//! Owns the `sessions` map (conn-id → session) and the secondary
//! `temp_ids` map used for onboarding, each behind its own mutex held only
//! for table mutation and single-entry lookup. Lock order is always
//! sessions → controller; `temp_ids` is a leaf.
//!
//! Demux policy: malformed control messages are logged and dropped without
//! disconnecting; unauthenticated audio and confidence are dropped
//! silently; nothing here propagates an error to the transport loop.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use boww_core::output::OutputRouter;
use boww_core::{
    ClientEntry, ClientMessage, ClientSession, ConfigView, GroupController, ServerMessage,
    VoiceDetector,
};

/// Ticker cadence driving arbitration and silence timeouts.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Human-visible onboarding log: one temp-id per connection, append-only.
const ONBOARDING_LOG: &str = "connecting_clients.txt";

/// The connection-facing half of the system.
pub struct Server {
    vad: Arc<dyn VoiceDetector>,
    groups: RwLock<HashMap<String, Arc<GroupController>>>,
    sessions: Mutex<HashMap<u64, Arc<ClientSession>>>,
    temp_ids: Mutex<HashMap<String, Weak<ClientSession>>>,
    /// Current allow-list, replaced wholesale on config (re)load.
    clients: RwLock<HashMap<String, ClientEntry>>,
    next_conn_id: AtomicU64,
    onboarding_log: PathBuf,
    wav_dir: PathBuf,
}

impl Server {
    pub fn new(vad: Arc<dyn VoiceDetector>) -> Self {
        Self {
            vad,
            groups: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            temp_ids: Mutex::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            onboarding_log: PathBuf::from(ONBOARDING_LOG),
            wav_dir: PathBuf::from("wav"),
        }
    }

    /// Redirect filesystem side effects (tests).
    pub fn with_dirs(mut self, onboarding_log: impl AsRef<Path>, wav_dir: impl AsRef<Path>) -> Self {
        self.onboarding_log = onboarding_log.as_ref().to_path_buf();
        self.wav_dir = wav_dir.as_ref().to_path_buf();
        self
    }

    /// Register a new connection: mint a provisional temp-id, insert into
    /// both tables, and append the temp-id to the onboarding log.
    pub fn register(&self, outbound: UnboundedSender<ServerMessage>) -> Arc<ClientSession> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let temp_id = mint_temp_id();

        let session = Arc::new(ClientSession::new(conn_id, temp_id.clone(), outbound));
        self.sessions.lock().insert(conn_id, Arc::clone(&session));
        self.temp_ids
            .lock()
            .insert(temp_id.clone(), Arc::downgrade(&session));

        if let Err(e) = append_line(&self.onboarding_log, &temp_id) {
            warn!("failed to append onboarding log: {e}");
        }

        info!(conn_id, temp_id = temp_id.as_str(), "new connection");
        session
    }

    fn session(&self, conn_id: u64) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&conn_id).cloned()
    }

    fn controller(&self, group: &str) -> Option<Arc<GroupController>> {
        self.groups.read().get(group).cloned()
    }

    /// Handle one text control frame.
    pub fn on_text(&self, conn_id: u64, raw: &str) {
        let Some(session) = self.session(conn_id) else {
            return;
        };

        let message = match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id, "dropping malformed control message: {e}");
                return;
            }
        };

        match message {
            ClientMessage::Hello { guid } => {
                let entry = self.clients.read().get(&guid).cloned();
                match entry {
                    Some(entry) => {
                        if let Some(temp_id) = session.authenticate(&guid, &entry.group) {
                            self.temp_ids.lock().remove(&temp_id);
                        }
                        info!(
                            conn_id,
                            guid = guid.as_str(),
                            group = entry.group.as_str(),
                            "client authenticated"
                        );
                    }
                    None => {
                        info!(conn_id, guid = guid.as_str(), "hello with unknown guid, ignoring");
                    }
                }
            }
            ClientMessage::Confidence { value } => {
                if !session.is_authenticated() {
                    return;
                }
                let Some(group) = session.group() else {
                    return;
                };
                let Some(controller) = self.controller(&group) else {
                    debug!(conn_id, group = group.as_str(), "confidence for unknown group");
                    return;
                };
                // Ack before the score enters the decision engine.
                session.send(ServerMessage::ConfRec);
                controller.handle_confidence(&session, value);
            }
        }
    }

    /// Handle one binary PCM frame, already decoded to i16.
    pub fn on_audio(&self, conn_id: u64, pcm: &[i16]) {
        let Some(session) = self.session(conn_id) else {
            return;
        };
        let Some(group) = session.group() else {
            // Unauthenticated audio: drop silently.
            return;
        };
        if let Some(controller) = self.controller(&group) {
            controller.handle_audio(&session, pcm);
        }
    }

    pub fn on_close(&self, conn_id: u64) {
        let session = self.sessions.lock().remove(&conn_id);
        if let Some(session) = session {
            if let Some(temp_id) = session.temp_id() {
                self.temp_ids.lock().remove(&temp_id);
            }
            info!(conn_id, id = session.stable_id().as_str(), "disconnected");
        }
    }

    /// One ticker pass over every group controller.
    pub fn tick(&self) {
        let controllers: Vec<Arc<GroupController>> =
            self.groups.read().values().cloned().collect();
        for controller in controllers {
            controller.on_tick();
        }
    }

    /// Apply a configuration view: new group names get fresh controllers,
    /// existing controllers stage the update for their next idle moment,
    /// and the client allow-list is replaced.
    pub fn apply_config(&self, view: &ConfigView) {
        for group in view.groups() {
            let mut groups = self.groups.write();
            let existing = groups.get(group.name.as_str()).cloned();
            match existing {
                Some(controller) => controller.update_config(group.clone()),
                None => {
                    info!(group = group.name.as_str(), "creating group controller");
                    groups.insert(
                        group.name.clone(),
                        Arc::new(GroupController::with_router(
                            group.clone(),
                            Arc::clone(&self.vad),
                            OutputRouter::with_wav_dir(&self.wav_dir),
                        )),
                    );
                }
            }
        }

        *self.clients.write() = view
            .clients()
            .cloned()
            .map(|entry| (entry.guid.clone(), entry))
            .collect();
    }

    /// Tell a provisional session which GUID the operator assigned to it.
    /// The client is expected to reconnect and present it in a fresh hello.
    pub fn onboard(&self, temp_id: &str, guid: &str) {
        let session = self.temp_ids.lock().get(temp_id).and_then(Weak::upgrade);
        match session {
            Some(session) => {
                info!(temp_id, guid, "onboarding client");
                session.send(ServerMessage::AssignId { id: guid.to_string() });
            }
            None => debug!(temp_id, "onboarding target not connected"),
        }
    }
}

/// Run the 10 ms ticker until `running` clears.
pub fn spawn_ticker(server: Arc<Server>, running: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::Relaxed) {
            server.tick();
            std::thread::sleep(TICK_INTERVAL);
        }
        debug!("ticker stopped");
    })
}

/// `temp-XXXXXXXX` with 8 uppercase hex digits.
fn mint_temp_id() -> String {
    format!("temp-{:08X}", rand::random::<u32>())
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}
