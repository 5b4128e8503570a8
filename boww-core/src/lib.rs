//! # boww-core
//!
//! Server-side engine for a Bag-of-Wake-Words arbitration network.
//!
//! ## Architecture
//!
//! ```text
//! WebSocket frames → Server core → GroupController (per group)
//!                                       │
//!                        ┌──────────────┴──────────────┐
//!                   AGC + VAD                    attenuated raw
//!                 (detection path)               (output path)
//!                        │                              │
//!                 last-voice refresh            OutputRouter
//!                                              (WAV file / playback device)
//! ```
//!
//! Each group runs a small state machine (IDLE → ARBITRATING → LOCKED):
//! clients report wake-word confidence scores, the highest live bidder wins
//! the arbitration window and becomes the group's single active streamer,
//! and a neural VAD decides when the utterance has ended.
//!
//! All heap work happens on the caller's (blocking) thread under the group
//! lock; nothing here touches the async executor directly.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod agc;
pub mod config;
pub mod error;
pub mod group;
pub mod output;
pub mod protocol;
pub mod session;
pub mod vad;

// Convenience re-exports for downstream crates
pub use config::{ClientEntry, ConfigView, GroupConfig, OutputKind};
pub use error::BowwError;
pub use group::{GroupController, GroupState};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::ClientSession;
pub use vad::{DisabledVad, VadSessionState, VoiceDetector};

#[cfg(feature = "onnx")]
pub use vad::SileroVad;
