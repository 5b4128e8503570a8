//! Scoped PCM output routing.
//!
//! One router per group, bound to at most one streaming session at a time.
//! `open` acquires a sink for the configured output kind; when the playback
//! device cannot be opened and the group allows it, the router falls back
//! to a WAV file *for this cycle only*; the configured kind is never
//! mutated. `close` releases whichever sink actually opened.
//!
//! The busy flag and sink handle live under one mutex so a late `close`
//! racing a re-`open` is safe.

mod wav;

#[cfg(feature = "audio-cpal")]
mod playback;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::{GroupConfig, OutputKind};
use crate::error::{BowwError, Result};

use wav::WavSink;

#[cfg(feature = "audio-cpal")]
use playback::DeviceSink;

/// Default directory for captured WAV files.
const WAV_DIR: &str = "wav";

enum ActiveSink {
    File(WavSink),
    #[cfg(feature = "audio-cpal")]
    Device(DeviceSink),
}

impl ActiveSink {
    fn write(&mut self, chunk: &[i16]) {
        match self {
            ActiveSink::File(sink) => sink.write(chunk),
            #[cfg(feature = "audio-cpal")]
            ActiveSink::Device(sink) => sink.write(chunk),
        }
    }

    fn close(self) {
        match self {
            ActiveSink::File(sink) => sink.close(),
            #[cfg(feature = "audio-cpal")]
            ActiveSink::Device(sink) => sink.close(),
        }
    }
}

/// Routes a group's captured PCM to its configured sink.
pub struct OutputRouter {
    wav_dir: PathBuf,
    inner: Mutex<Option<ActiveSink>>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self {
            wav_dir: PathBuf::from(WAV_DIR),
            inner: Mutex::new(None),
        }
    }

    /// Use a different base directory for WAV output.
    pub fn with_wav_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            wav_dir: dir.as_ref().to_path_buf(),
            inner: Mutex::new(None),
        }
    }

    /// Acquire a sink for one capture cycle, bound to `source_id`.
    ///
    /// Returns `false` when already busy or when no sink (including the
    /// fallback, if enabled) could be opened. Idempotent against itself.
    pub fn open(&self, source_id: &str, config: &GroupConfig) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return false;
        }

        match self.open_as(config.output, source_id, config) {
            Ok(sink) => {
                *inner = Some(sink);
                true
            }
            Err(e) if config.output == OutputKind::Device && config.fallback_to_file_on_busy => {
                warn!(
                    group = config.name.as_str(),
                    error = %e,
                    "playback device unavailable, falling back to file output"
                );
                match self.open_as(OutputKind::File, source_id, config) {
                    Ok(sink) => {
                        *inner = Some(sink);
                        true
                    }
                    Err(e) => {
                        error!(group = config.name.as_str(), "fallback file open failed: {e}");
                        false
                    }
                }
            }
            Err(e) => {
                error!(group = config.name.as_str(), "output open failed: {e}");
                false
            }
        }
    }

    /// Open a specific sink kind without consulting the fallback policy.
    fn open_as(&self, kind: OutputKind, source_id: &str, config: &GroupConfig) -> Result<ActiveSink> {
        match kind {
            OutputKind::File => {
                let sink = WavSink::open(&self.wav_dir, source_id, config)?;
                info!(
                    group = config.name.as_str(),
                    path = %sink.path().display(),
                    "recording to file"
                );
                Ok(ActiveSink::File(sink))
            }
            #[cfg(feature = "audio-cpal")]
            OutputKind::Device => {
                let sink = DeviceSink::open(config)?;
                info!(group = config.name.as_str(), "streaming to playback device");
                Ok(ActiveSink::Device(sink))
            }
            #[cfg(not(feature = "audio-cpal"))]
            OutputKind::Device => Err(BowwError::AudioDevice(
                "compiled without audio-cpal feature".into(),
            )),
        }
    }

    /// Write a chunk to the active sink. No-op while not open.
    pub fn write(&self, chunk: &[i16]) {
        let mut inner = self.inner.lock();
        if let Some(sink) = inner.as_mut() {
            sink.write(chunk);
        }
    }

    /// Finalize and release the active sink. Safe to call when not busy.
    pub fn close(&self) {
        let sink = self.inner.lock().take();
        if let Some(sink) = sink {
            sink.close();
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OutputRouter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;

    fn file_config() -> GroupConfig {
        GroupConfig::named("testgroup")
    }

    #[test]
    fn open_close_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        let config = file_config();

        assert!(!router.is_busy());
        assert!(router.open("client-a", &config));
        assert!(router.is_busy());

        router.close();
        assert!(!router.is_busy());

        // Distinct source id: filename timestamps only have second
        // resolution, and both cycles run within one.
        assert!(router.open("client-b", &config));
        assert!(router.is_busy());
        router.close();

        // Two finalized files, one per cycle.
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn second_open_is_refused_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        let config = file_config();

        assert!(router.open("client-a", &config));
        assert!(!router.open("client-b", &config));
        router.close();
    }

    #[test]
    fn write_and_close_are_safe_when_not_open() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        router.write(&[1, 2, 3]);
        router.close();
        assert!(!router.is_busy());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn wav_header_sizes_are_patched_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        let config = file_config();

        assert!(router.open("client-a", &config));
        router.write(&vec![100i16; 2048]);
        router.write(&vec![-100i16; 512]);
        router.close();

        let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let bytes = std::fs::read(entry.path()).unwrap();

        let expected_len = 44 + (2048 + 512) * 2;
        assert_eq!(bytes.len(), expected_len);

        let riff_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data_size = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
        assert_eq!(riff_size as usize, bytes.len() - 8);
        assert_eq!(data_size as usize, bytes.len() - 44);

        // Filename shape: <source>_<group>_<YYYYMMDD-HHMMSS>.wav
        let name = entry.file_name().into_string().unwrap();
        assert!(name.starts_with("client-a_testgroup_"), "name={name}");
        assert!(name.ends_with(".wav"));
    }

    #[test]
    fn wav_contents_round_trip_through_hound() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        let config = file_config();

        let samples: Vec<i16> = (0..512).map(|i| (i as i16) - 256).collect();
        assert!(router.open("client-a", &config));
        router.write(&samples);
        router.close();

        let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let mut reader = hound::WavReader::open(entry.path()).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);

        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn device_failure_falls_back_to_file_without_mutating_config() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        let mut config = file_config();
        config.output = OutputKind::Device;
        config.device = Some("no-such-playback-device".into());
        config.fallback_to_file_on_busy = true;

        assert!(router.open("client-a", &config));
        assert!(router.is_busy());
        router.write(&vec![7i16; 256]);
        router.close();
        assert!(!router.is_busy());

        // The cycle landed in a WAV file, and the configured kind survives.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(config.output, OutputKind::Device);
    }

    #[test]
    fn device_failure_without_fallback_leaves_router_idle() {
        let dir = tempfile::tempdir().unwrap();
        let router = OutputRouter::with_wav_dir(dir.path());
        let mut config = file_config();
        config.output = OutputKind::Device;
        config.device = Some("no-such-playback-device".into());
        config.fallback_to_file_on_busy = false;

        assert!(!router.open("client-a", &config));
        assert!(!router.is_busy());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
