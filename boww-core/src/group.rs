//! Per-group arbitration and streaming state machine.
//!
//! ## States
//!
//! ```text
//! IDLE ──first confidence──► ARBITRATING ──timeout, live winner──► LOCKED
//!   ▲                            │                                   │
//!   └────no live candidates──────┘         silence timeout /         │
//!   ▲                                      streamer lost             │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pipeline (LOCKED, active streamer only)
//!
//! ```text
//! 1. Ingest: append PCM to the FIFO
//! 2. While ≥ 512 samples: pop one chunk into identical raw/agc copies
//!    a. AGC + VAD on the agc copy (detection path, never persisted)
//!    b. probability > 0.5 refreshes the streamer's last-voice clock
//!    c. raw copy, attenuated 0.4×, appended to the output accumulator
//! 3. Accumulator ≥ 2048 samples: flush whole to the output router
//! ```
//!
//! Detection wants a normalized signal regardless of microphone gain;
//! the persisted path keeps the original timbre. The 0.4× attenuation
//! leaves headroom when several groups share one physical speaker.
//!
//! One mutex guards the whole controller; hold time is bounded by draining
//! the current ingest buffer, which is small constant work per chunk.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::agc::Agc;
use crate::config::GroupConfig;
use crate::output::OutputRouter;
use crate::session::ClientSession;
use crate::vad::VoiceDetector;

/// Samples per VAD frame: the model's expected window (32 ms at 16 kHz).
pub const VAD_CHUNK_SIZE: usize = 512;
/// Accumulator size at which the router is flushed (128 ms at 16 kHz).
pub const JITTER_TARGET: usize = 2048;
/// Speech probability above which the last-voice clock is refreshed.
const VOICE_PROB_THRESHOLD: f32 = 0.5;
/// Gain applied to the persisted path.
const OUTPUT_ATTENUATION: f32 = 0.4;

/// Arbitration phase of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Arbitrating,
    Locked,
}

/// A transient bid: the reported score plus a non-owning session ref, so a
/// candidate that disconnects before resolution simply vanishes.
struct ConfidenceEntry {
    score: f32,
    session: Weak<ClientSession>,
}

struct Inner {
    config: GroupConfig,
    /// Applied on the next transition to IDLE, never mid-lock.
    pending_config: Option<GroupConfig>,
    state: GroupState,
    /// Keyed by stable session id; kept through LOCKED so the conclude
    /// fan-out can still notify losers, cleared on every reset.
    candidates: BTreeMap<String, ConfidenceEntry>,
    active: Option<Arc<ClientSession>>,
    arbitration_started: Option<Instant>,
    agc: Agc,
    ingest: VecDeque<i16>,
    accumulator: Vec<i16>,
    // Scratch chunks reused across iterations.
    raw_chunk: Vec<i16>,
    agc_chunk: Vec<i16>,
    chunks_processed: u64,
}

/// The per-group decision engine. All public methods take the group lock.
pub struct GroupController {
    name: String,
    vad: Arc<dyn VoiceDetector>,
    router: OutputRouter,
    inner: Mutex<Inner>,
}

impl GroupController {
    pub fn new(config: GroupConfig, vad: Arc<dyn VoiceDetector>) -> Self {
        Self::with_router(config, vad, OutputRouter::new())
    }

    /// Construct with a specific router (tests point it at a temp dir).
    pub fn with_router(config: GroupConfig, vad: Arc<dyn VoiceDetector>, router: OutputRouter) -> Self {
        let name = config.name.clone();
        info!(group = name.as_str(), "group controller initialized");
        Self {
            name,
            vad,
            router,
            inner: Mutex::new(Inner {
                config,
                pending_config: None,
                state: GroupState::Idle,
                candidates: BTreeMap::new(),
                active: None,
                arbitration_started: None,
                agc: Agc::default(),
                ingest: VecDeque::new(),
                accumulator: Vec::with_capacity(JITTER_TARGET * 2),
                raw_chunk: Vec::with_capacity(VAD_CHUNK_SIZE),
                agc_chunk: Vec::with_capacity(VAD_CHUNK_SIZE),
                chunks_processed: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    pub fn active_streamer_id(&self) -> Option<String> {
        self.inner.lock().active.as_ref().map(|s| s.stable_id())
    }

    pub fn config(&self) -> GroupConfig {
        self.inner.lock().config.clone()
    }

    pub fn is_output_busy(&self) -> bool {
        self.router.is_busy()
    }

    /// Stage a new configuration. Scalar changes never land mid-lock: a
    /// quiescent group takes them immediately, otherwise they wait for the
    /// next transition to IDLE.
    pub fn update_config(&self, config: GroupConfig) {
        let mut inner = self.inner.lock();
        if inner.state == GroupState::Idle {
            inner.config = config;
            inner.pending_config = None;
        } else {
            inner.pending_config = Some(config);
        }
    }

    /// Record a wake-word confidence bid from an authenticated session.
    ///
    /// Late bids while LOCKED are ignored; the winner is already chosen.
    /// A repeated bid from the same session overwrites its prior score.
    pub fn handle_confidence(&self, session: &Arc<ClientSession>, score: f32) {
        let mut inner = self.inner.lock();
        if inner.state == GroupState::Locked {
            debug!(
                group = self.name.as_str(),
                candidate = session.stable_id().as_str(),
                "confidence after lock, ignoring"
            );
            return;
        }

        let id = session.stable_id();
        info!(
            group = self.name.as_str(),
            candidate = id.as_str(),
            score,
            "candidate bid"
        );
        inner.candidates.insert(
            id,
            ConfidenceEntry {
                score,
                session: Arc::downgrade(session),
            },
        );

        if inner.state == GroupState::Idle {
            inner.state = GroupState::Arbitrating;
            inner.arbitration_started = Some(Instant::now());
            info!(group = self.name.as_str(), "arbitration started");
        }
    }

    /// Driven at ≈10 ms cadence: expires the arbitration window and the
    /// active streamer's silence window.
    pub fn on_tick(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            GroupState::Idle => {}
            GroupState::Arbitrating => {
                let elapsed_ms = inner
                    .arbitration_started
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if elapsed_ms >= inner.config.arbitration_timeout_ms {
                    self.resolve_arbitration(&mut inner);
                }
            }
            GroupState::Locked => {
                let Some(active) = inner.active.clone() else {
                    self.reset_group(&mut inner);
                    return;
                };

                if active.is_disconnected() {
                    info!(
                        group = self.name.as_str(),
                        streamer = active.stable_id().as_str(),
                        "active streamer disconnected, resetting"
                    );
                    self.reset_group(&mut inner);
                    return;
                }

                let silence_ms = active.time_since_last_voice_ms();
                if silence_ms > inner.config.vad_no_voice_ms {
                    info!(
                        group = self.name.as_str(),
                        silence_ms, "silence timeout, concluding utterance"
                    );
                    active.send_stop();
                    for entry in inner.candidates.values() {
                        if let Some(candidate) = entry.session.upgrade() {
                            if !Arc::ptr_eq(&candidate, &active) {
                                candidate.send_stop();
                            }
                        }
                    }
                    self.reset_group(&mut inner);
                }
            }
        }
    }

    /// Pick the winner: one walk over the candidate map, pruning dead
    /// entries. Strict `>` keeps the earliest entry in stable-id order on
    /// ties, which is deterministic across runs.
    fn resolve_arbitration(&self, inner: &mut Inner) {
        let mut best_score = -1.0f32;
        let mut winner: Option<Arc<ClientSession>> = None;

        inner.candidates.retain(|_, entry| match entry.session.upgrade() {
            Some(session) => {
                if entry.score > best_score {
                    best_score = entry.score;
                    winner = Some(session);
                }
                true
            }
            None => false,
        });

        let Some(winner) = winner else {
            info!(group = self.name.as_str(), "no live candidates, resetting");
            self.reset_group(inner);
            return;
        };

        info!(
            group = self.name.as_str(),
            winner = winner.stable_id().as_str(),
            score = best_score,
            "arbitration resolved"
        );

        inner.state = GroupState::Locked;
        inner.ingest.clear();
        inner.accumulator.clear();
        inner.chunks_processed = 0;

        winner.install_vad_state(self.vad.create_session_state());

        if !self.router.open(&winner.stable_id(), &inner.config) {
            warn!(
                group = self.name.as_str(),
                "no output sink available, releasing lock"
            );
            winner.clear_vad_state();
            self.reset_group(inner);
            return;
        }

        for entry in inner.candidates.values() {
            if let Some(candidate) = entry.session.upgrade() {
                if !Arc::ptr_eq(&candidate, &winner) {
                    candidate.send_stop();
                }
            }
        }

        inner.active = Some(winner);
    }

    /// Back to IDLE: flush the accumulator tail, release the streamer and
    /// its VAD state, close the sink, clear all buffers, and take any
    /// staged configuration.
    fn reset_group(&self, inner: &mut Inner) {
        if !inner.accumulator.is_empty() && self.router.is_busy() {
            self.router.write(&inner.accumulator);
        }
        inner.accumulator.clear();
        inner.ingest.clear();
        inner.candidates.clear();
        inner.state = GroupState::Idle;
        inner.arbitration_started = None;
        if let Some(active) = inner.active.take() {
            active.clear_vad_state();
        }
        self.router.close();

        if let Some(config) = inner.pending_config.take() {
            info!(group = self.name.as_str(), "applying updated group configuration");
            inner.config = config;
        }
    }

    /// Feed PCM from a session. Frames from anyone but the active streamer
    /// of a LOCKED group are discarded.
    pub fn handle_audio(&self, session: &Arc<ClientSession>, pcm: &[i16]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state != GroupState::Locked {
            return;
        }
        let Some(active) = inner.active.clone() else {
            return;
        };
        if !Arc::ptr_eq(&active, session) {
            return;
        }

        // Stage 1: ingest.
        inner.ingest.extend(pcm.iter().copied());

        // Stage 2: process full VAD frames.
        while inner.ingest.len() >= VAD_CHUNK_SIZE {
            inner.raw_chunk.clear();
            inner.raw_chunk.extend(inner.ingest.drain(..VAD_CHUNK_SIZE));
            inner.agc_chunk.clear();
            inner.agc_chunk.extend_from_slice(&inner.raw_chunk);

            // Detection path: AGC-normalized, never persisted.
            inner.agc.process(&mut inner.agc_chunk);
            let voice_prob = {
                let mut state = active.vad_state();
                match state.as_mut() {
                    Some(state) => self.vad.process(state, &inner.agc_chunk),
                    None => 0.0,
                }
            };

            if voice_prob > VOICE_PROB_THRESHOLD {
                active.update_last_voice();
            }

            inner.chunks_processed += 1;
            if inner.chunks_processed % 10 == 0 {
                debug!(
                    group = self.name.as_str(),
                    voice_prob,
                    gain = inner.agc.gain(),
                    "pipeline frame"
                );
            }

            // Output path: attenuated raw.
            for &sample in &inner.raw_chunk {
                let attenuated = (sample as f32 * OUTPUT_ATTENUATION).clamp(-32768.0, 32767.0);
                inner.accumulator.push(attenuated as i16);
            }
        }

        // Stage 3: jitter-buffered flush.
        if inner.accumulator.len() >= JITTER_TARGET {
            self.router.write(&inner.accumulator);
            inner.accumulator.clear();
        }
    }
}
