//! Voice activity detection abstraction.
//!
//! The `VoiceDetector` trait is the extensibility seam: the group controller
//! only sees chunk-in / probability-out, so the ONNX-backed `SileroVad` can
//! be swapped for a scripted detector in tests, or for `DisabledVad` when
//! the model file is missing.
//!
//! Recurrent model state is *per streamer*, not per detector: one engine is
//! shared by every group, and each locked streamer carries its own
//! `VadSessionState` for the duration of the lock cycle.

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroVad;

/// Recurrent state carried across chunks for one active streamer.
///
/// Flat row-major `[2, 1, 128]` float buffer, zeroed at allocation.
/// Opaque to callers; only a `VoiceDetector` reads or writes it.
#[derive(Debug, Clone)]
pub struct VadSessionState {
    pub(crate) state: Vec<f32>,
}

/// Recurrent state size: 2 layers × 1 batch × 128 units.
pub(crate) const STATE_LEN: usize = 256;

impl VadSessionState {
    pub fn zeroed() -> Self {
        Self {
            state: vec![0.0; STATE_LEN],
        }
    }
}

impl Default for VadSessionState {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Contract for speech-probability backends.
///
/// Implementations must be shareable across groups (`&self` methods with
/// interior mutability where the backend itself is stateful).
pub trait VoiceDetector: Send + Sync + 'static {
    /// Allocate a fresh recurrent state for one streamer's lock cycle.
    fn create_session_state(&self) -> VadSessionState {
        VadSessionState::zeroed()
    }

    /// Speech probability in [0.0, 1.0] for one PCM chunk, updating `state`
    /// in place. Failures degrade to 0.0 so a stalled model cannot hold a
    /// lock open; the silence timeout is the escape hatch.
    fn process(&self, state: &mut VadSessionState, pcm: &[i16]) -> f32;
}

/// Detector used when no model could be loaded.
///
/// Reports no speech for every chunk, so locked groups unwind through the
/// normal silence timeout instead of hanging.
#[derive(Debug, Default)]
pub struct DisabledVad;

impl VoiceDetector for DisabledVad {
    fn process(&self, _state: &mut VadSessionState, _pcm: &[i16]) -> f32 {
        0.0
    }
}
