//! Silero VAD neural voice activity detector.
//!
//! Wraps the Silero VAD ONNX model published at
//! <https://github.com/snakers4/silero-vad> (v5 interface).
//!
//! ## Model I/O
//!
//! | Name     | Shape       | DType | Direction |
//! |----------|-------------|-------|-----------|
//! | `input`  | `[1, N]`    | f32   | in        |
//! | `state`  | `[2,1,128]` | f32   | in        |
//! | `sr`     | `[1]`       | i64   | in        |
//! | `output` | scalar prob | f32   | out       |
//! | `stateN` | `[2,1,128]` | f32   | out       |
//!
//! The recurrent state lives in the caller-owned `VadSessionState`, so one
//! loaded model serves any number of concurrent streamers.

use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{error, info};

use super::{VadSessionState, VoiceDetector, STATE_LEN};
use crate::error::{BowwError, Result};

/// Sample rate the model was trained at; also the `sr` input value.
const MODEL_SAMPLE_RATE: i64 = 16_000;

/// Neural VAD backed by an ONNX Runtime session.
///
/// The session is behind a mutex because `run` needs `&mut Session`;
/// per-call state is external, so the lock is held only for inference.
pub struct SileroVad {
    session: Mutex<Session>,
    input_name: String,
    state_name: String,
    sr_name: Option<String>,
    output_name: String,
    state_out_name: Option<String>,
}

impl SileroVad {
    /// Load the Silero VAD ONNX model from `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BowwError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let input_name = resolve_name(&input_names, &["input", "audio", "x"])
            .or_else(|| input_names.first().cloned())
            .ok_or_else(|| BowwError::OnnxSession("VAD model has no inputs".into()))?;
        let state_name = resolve_name(&input_names, &["state", "h_0", "hidden"])
            .ok_or_else(|| BowwError::OnnxSession("VAD model has no state input".into()))?;
        let sr_name = resolve_name(&input_names, &["sr", "sample_rate"]);
        let output_name = resolve_name(&output_names, &["output", "speech_prob", "prob"])
            .or_else(|| output_names.first().cloned())
            .ok_or_else(|| BowwError::OnnxSession("VAD model has no outputs".into()))?;
        let state_out_name = resolve_name(&output_names, &["stateN", "state_out", "hn"]);

        info!(
            path = %path.display(),
            inputs = ?input_names,
            outputs = ?output_names,
            "loaded silero vad model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            state_name,
            sr_name,
            output_name,
            state_out_name,
        })
    }

    /// Run one chunk through the model; update `state`; return probability.
    fn run_chunk(&self, state: &mut VadSessionState, pcm: &[i16]) -> Result<f32> {
        let normalized: Vec<f32> = pcm.iter().map(|&s| s as f32 / 32768.0).collect();

        let input_arr = Array2::<f32>::from_shape_vec((1, normalized.len()), normalized)
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?;
        let input_val = Value::from_array(input_arr)
            .map_err(|e: ort::Error| BowwError::OnnxSession(e.to_string()))?;

        let state_arr = Array3::<f32>::from_shape_vec((2, 1, 128), state.state.clone())
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?;
        let state_val = Value::from_array(state_arr)
            .map_err(|e: ort::Error| BowwError::OnnxSession(e.to_string()))?;

        let mut input_values: Vec<(String, SessionInputValue<'_>)> = vec![
            (self.input_name.clone(), input_val.into()),
            (self.state_name.clone(), state_val.into()),
        ];

        if let Some(sr_name) = &self.sr_name {
            let sr_arr = Array1::<i64>::from_elem(1, MODEL_SAMPLE_RATE);
            let sr_val = Value::from_array(sr_arr)
                .map_err(|e: ort::Error| BowwError::OnnxSession(e.to_string()))?;
            input_values.push((sr_name.clone(), sr_val.into()));
        }

        let mut session = self.session.lock();
        let outputs = session
            .run(input_values)
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?;

        let prob_output = outputs
            .get(self.output_name.as_str())
            .unwrap_or(&outputs[0]);
        let (_, prob_data) = prob_output
            .try_extract_tensor::<f32>()
            .map_err(|e| BowwError::OnnxSession(e.to_string()))?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        if let Some(state_out_name) = &self.state_out_name {
            if let Some(state_out) = outputs.get(state_out_name.as_str()) {
                let (_, state_data) = state_out
                    .try_extract_tensor::<f32>()
                    .map_err(|e| BowwError::OnnxSession(e.to_string()))?;
                if state_data.len() == STATE_LEN {
                    state.state.copy_from_slice(state_data);
                }
            }
        }

        Ok(prob.clamp(0.0, 1.0))
    }
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

impl VoiceDetector for SileroVad {
    fn process(&self, state: &mut VadSessionState, pcm: &[i16]) -> f32 {
        match self.run_chunk(state, pcm) {
            Ok(prob) => prob,
            Err(e) => {
                error!("vad inference error: {e}");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_name_is_case_insensitive() {
        let names = vec!["Input".to_string(), "stateN".to_string()];
        assert_eq!(
            resolve_name(&names, &["input"]).as_deref(),
            Some("Input")
        );
        assert_eq!(
            resolve_name(&names, &["staten"]).as_deref(),
            Some("stateN")
        );
        assert_eq!(resolve_name(&names, &["sr"]), None);
    }

    #[test]
    fn resolve_name_prefers_earlier_aliases() {
        let names = vec!["prob".to_string(), "output".to_string()];
        assert_eq!(
            resolve_name(&names, &["output", "prob"]).as_deref(),
            Some("output")
        );
    }

    #[test]
    fn missing_model_file_is_reported() {
        let err = SileroVad::new("definitely/not/a/model.onnx").unwrap_err();
        assert!(matches!(err, BowwError::ModelNotFound { .. }));
    }
}
