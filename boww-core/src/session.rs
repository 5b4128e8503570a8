//! Per-connection client session.
//!
//! A session starts *provisional* (server-minted `temp-XXXXXXXX` id) and
//! becomes *authenticated* (GUID + group) at most once, when the client's
//! `hello` GUID matches the allow-list. Until then it may not contribute
//! audio or confidence scores.
//!
//! The session holds the transport only as a small outbound sender (the
//! service handle), never a back-pointer to the server. Dropping the
//! transport's receive side is how the rest of the system observes a dead
//! connection.

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::ServerMessage;
use crate::vad::VadSessionState;

/// Connection identity phases.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    Provisional { temp_id: String },
    Authenticated { guid: String, group: String },
}

/// One connected client.
pub struct ClientSession {
    conn_id: u64,
    outbound: UnboundedSender<ServerMessage>,
    identity: Mutex<Identity>,
    /// Installed by the group controller at lock time, dropped on reset.
    vad_state: Mutex<Option<VadSessionState>>,
    /// Monotonic timestamp of the last chunk the VAD called speech.
    last_voice: Mutex<Instant>,
}

impl ClientSession {
    pub fn new(conn_id: u64, temp_id: String, outbound: UnboundedSender<ServerMessage>) -> Self {
        Self {
            conn_id,
            outbound,
            identity: Mutex::new(Identity::Provisional { temp_id }),
            vad_state: Mutex::new(None),
            last_voice: Mutex::new(Instant::now()),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Stable id: the GUID once authenticated, the temp-id before.
    pub fn stable_id(&self) -> String {
        match &*self.identity.lock() {
            Identity::Provisional { temp_id } => temp_id.clone(),
            Identity::Authenticated { guid, .. } => guid.clone(),
        }
    }

    /// Temp-id while provisional, `None` once authenticated.
    pub fn temp_id(&self) -> Option<String> {
        match &*self.identity.lock() {
            Identity::Provisional { temp_id } => Some(temp_id.clone()),
            Identity::Authenticated { .. } => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(&*self.identity.lock(), Identity::Authenticated { .. })
    }

    pub fn group(&self) -> Option<String> {
        match &*self.identity.lock() {
            Identity::Provisional { .. } => None,
            Identity::Authenticated { group, .. } => Some(group.clone()),
        }
    }

    /// Promote to an authenticated identity, clearing the temp-id.
    ///
    /// Returns the temp-id this session held, if it was still provisional;
    /// a second authentication on the same connection is a no-op.
    pub fn authenticate(&self, guid: &str, group: &str) -> Option<String> {
        let mut identity = self.identity.lock();
        match &*identity {
            Identity::Provisional { temp_id } => {
                let temp_id = temp_id.clone();
                *identity = Identity::Authenticated {
                    guid: guid.to_string(),
                    group: group.to_string(),
                };
                Some(temp_id)
            }
            Identity::Authenticated { .. } => None,
        }
    }

    /// Queue a control message for the transport writer. Send failures mean
    /// the connection is gone; callers have nothing useful to do with that.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    pub fn send_stop(&self) {
        self.send(ServerMessage::Stop);
    }

    /// True once the transport writer (receive half) has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.outbound.is_closed()
    }

    // ── VAD state, owned by the group controller during a lock cycle ─────

    /// Install a fresh recurrent state and stamp the last-voice clock, so
    /// the silence window starts counting from lock entry.
    pub fn install_vad_state(&self, state: VadSessionState) {
        *self.vad_state.lock() = Some(state);
        self.update_last_voice();
    }

    pub fn clear_vad_state(&self) {
        *self.vad_state.lock() = None;
    }

    pub fn vad_state(&self) -> parking_lot::MutexGuard<'_, Option<VadSessionState>> {
        self.vad_state.lock()
    }

    pub fn update_last_voice(&self) {
        *self.last_voice.lock() = Instant::now();
    }

    pub fn time_since_last_voice_ms(&self) -> u64 {
        self.last_voice.lock().elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("conn_id", &self.conn_id)
            .field("id", &self.stable_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session() -> (ClientSession, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSession::new(1, "temp-0A1B2C3D".into(), tx), rx)
    }

    #[test]
    fn provisional_identity_uses_temp_id() {
        let (s, _rx) = session();
        assert!(!s.is_authenticated());
        assert_eq!(s.stable_id(), "temp-0A1B2C3D");
        assert_eq!(s.temp_id().as_deref(), Some("temp-0A1B2C3D"));
        assert_eq!(s.group(), None);
    }

    #[test]
    fn authentication_is_one_way_and_clears_temp_id() {
        let (s, _rx) = session();
        let prior = s.authenticate("g-1", "kitchen");
        assert_eq!(prior.as_deref(), Some("temp-0A1B2C3D"));
        assert!(s.is_authenticated());
        assert_eq!(s.stable_id(), "g-1");
        assert_eq!(s.temp_id(), None);
        assert_eq!(s.group().as_deref(), Some("kitchen"));

        // Second hello must not re-promote.
        assert_eq!(s.authenticate("g-2", "attic"), None);
        assert_eq!(s.stable_id(), "g-1");
    }

    #[test]
    fn stop_signal_reaches_the_outbound_channel() {
        let (s, mut rx) = session();
        s.send_stop();
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Stop);
    }

    #[test]
    fn disconnect_is_visible_once_receiver_drops() {
        let (s, rx) = session();
        assert!(!s.is_disconnected());
        drop(rx);
        assert!(s.is_disconnected());
    }

    #[test]
    fn installing_vad_state_stamps_last_voice() {
        let (s, _rx) = session();
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(s.time_since_last_voice_ms() >= 10);
        s.install_vad_state(VadSessionState::zeroed());
        assert!(s.time_since_last_voice_ms() < 10);
        assert!(s.vad_state().is_some());
        s.clear_vad_state();
        assert!(s.vad_state().is_none());
    }
}
