//! RIFF/WAVE file sink.
//!
//! Files land in `<wav_dir>/<source_id>_<group>_<YYYYMMDD-HHMMSS>.wav` as
//! PCM int16 LE. hound finalizes the header on close, patching the RIFF
//! overall size and `data` chunk size from the written length, so an
//! interrupted capture still yields a well-formed file.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{error, warn};

use crate::config::GroupConfig;
use crate::error::{BowwError, Result};

pub(super) struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
}

impl WavSink {
    pub(super) fn open(dir: &Path, source_id: &str, config: &GroupConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{}_{}_{}.wav", source_id, config.name, stamp));

        let spec = WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let writer = WavWriter::create(&path, spec)
            .map_err(|e| BowwError::OutputSink(e.to_string()))?;

        Ok(Self { writer, path })
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    /// Filesystem failures mid-stream are unrecoverable on target hosts;
    /// log once per chunk and keep the capture cycle alive.
    pub(super) fn write(&mut self, chunk: &[i16]) {
        for &sample in chunk {
            if let Err(e) = self.writer.write_sample(sample) {
                warn!(path = %self.path.display(), "wav write failed: {e}");
                return;
            }
        }
    }

    pub(super) fn close(self) {
        let path = self.path;
        if let Err(e) = self.writer.finalize() {
            error!(path = %path.display(), "wav finalize failed: {e}");
        }
    }
}
