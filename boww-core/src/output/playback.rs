//! Local playback device sink via cpal.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). The stream is therefore created, kept alive, and dropped on a
//! dedicated playback thread; the sink handle only carries the ring-buffer
//! producer and a shutdown flag, both `Send`. A sync channel confirms
//! open success/failure to the caller before `open` returns, so the router
//! can apply its fallback policy synchronously.
//!
//! The output callback runs on an OS audio thread and must not block or
//! allocate: it pops from a lock-free SPSC ring and fills any shortfall
//! with silence, which doubles as transparent underrun recovery.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapProd, HeapRb,
};
use tracing::{error, warn};

use crate::config::GroupConfig;
use crate::error::{BowwError, Result};

/// Queued-audio budget in milliseconds. Must cover at least one jitter
/// flush from the group pipeline (128 ms) plus scheduling slack.
const QUEUE_BUDGET_MS: usize = 250;

pub(super) struct DeviceSink {
    producer: HeapProd<i16>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSink {
    pub(super) fn open(config: &GroupConfig) -> Result<Self> {
        let capacity =
            config.sample_rate as usize * config.channels as usize * QUEUE_BUDGET_MS / 1000;
        let (producer, consumer) = HeapRb::<i16>::new(capacity.max(2048)).split();

        let running = Arc::new(AtomicBool::new(true));
        let running_thread = Arc::clone(&running);

        // Sync handshake: the playback thread reports whether the device
        // actually opened, so fallback decisions happen before we return.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let target = config.device.clone();
        let channels = config.channels;
        let sample_rate = config.sample_rate;

        let thread = std::thread::Builder::new()
            .name("boww-playback".into())
            .spawn(move || {
                let stream = match open_stream(target.as_deref(), channels, sample_rate, consumer) {
                    Ok(stream) => {
                        let _ = open_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                while running_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(10));
                }

                // Give the queue a moment to drain before the device closes.
                std::thread::sleep(Duration::from_millis(100));
                drop(stream);
            })?;

        match open_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                producer,
                running,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(BowwError::AudioDevice(
                    "playback thread died before opening the device".into(),
                ))
            }
        }
    }

    pub(super) fn write(&mut self, chunk: &[i16]) {
        let written = self.producer.push_slice(chunk);
        if written < chunk.len() {
            warn!(
                dropped = chunk.len() - written,
                "playback queue full, dropping samples"
            );
        }
    }

    pub(super) fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open the playback stream on the current thread. Must be called from the
/// thread that will also drop the returned stream.
fn open_stream(
    target: Option<&str>,
    channels: u16,
    sample_rate: u32,
    mut consumer: ringbuf::HeapCons<i16>,
) -> Result<Stream> {
    let host = cpal::default_host();

    let device = match target {
        Some(name) => host
            .output_devices()
            .map_err(|e| BowwError::AudioDevice(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| {
                BowwError::AudioDevice(format!("playback device '{name}' not found"))
            })?,
        None => host
            .default_output_device()
            .ok_or_else(|| BowwError::AudioDevice("no default output device".into()))?,
    };

    let supported = device
        .default_output_config()
        .map_err(|e| BowwError::AudioDevice(e.to_string()))?;

    let stream_config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _info| {
                let popped = consumer.pop_slice(data);
                data[popped..].fill(0);
            },
            |err| error!("playback stream error: {err}"),
            None,
        ),
        SampleFormat::F32 => {
            let mut scratch: Vec<i16> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info| {
                    scratch.resize(data.len(), 0);
                    let popped = consumer.pop_slice(&mut scratch);
                    scratch[popped..].fill(0);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = sample as f32 / 32768.0;
                    }
                },
                |err| error!("playback stream error: {err}"),
                None,
            )
        }
        fmt => {
            return Err(BowwError::AudioDevice(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| BowwError::AudioDevice(e.to_string()))?;

    stream
        .play()
        .map_err(|e| BowwError::AudioDevice(e.to_string()))?;

    Ok(stream)
}
