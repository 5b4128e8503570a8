//! Group and client configuration types.
//!
//! These are the deserialized shapes of the server's YAML config; loading
//! and file-watching live in the server binary. `ConfigView` is the
//! read-only projection handed to the server core on every (re)load.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_ARBITRATION_TIMEOUT_MS: u64 = 200;
pub const DEFAULT_VAD_NO_VOICE_MS: u64 = 1_000;

/// Where a group's captured audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// RIFF/WAVE file under the wav output directory.
    File,
    /// Local playback device.
    #[serde(rename = "alsa")]
    Device,
}

/// Per-group configuration.
///
/// Unspecified fields fall back to the documented defaults, so a minimal
/// group entry is just `{ name: kitchen }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_arbitration_timeout_ms")]
    pub arbitration_timeout_ms: u64,
    #[serde(default = "default_vad_no_voice_ms")]
    pub vad_no_voice_ms: u64,
    #[serde(default = "default_output")]
    pub output: OutputKind,
    /// Playback device name; `None` selects the system default.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_fallback")]
    pub fallback_to_file_on_busy: bool,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}
fn default_channels() -> u16 {
    DEFAULT_CHANNELS
}
fn default_arbitration_timeout_ms() -> u64 {
    DEFAULT_ARBITRATION_TIMEOUT_MS
}
fn default_vad_no_voice_ms() -> u64 {
    DEFAULT_VAD_NO_VOICE_MS
}
fn default_output() -> OutputKind {
    OutputKind::File
}
fn default_fallback() -> bool {
    true
}

impl GroupConfig {
    /// A config with defaults for everything but the name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            arbitration_timeout_ms: DEFAULT_ARBITRATION_TIMEOUT_MS,
            vad_no_voice_ms: DEFAULT_VAD_NO_VOICE_MS,
            output: OutputKind::File,
            device: None,
            fallback_to_file_on_busy: true,
        }
    }
}

/// One allow-listed client identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub guid: String,
    pub group: String,
    /// When present, requests onboarding of the named provisional session.
    #[serde(default)]
    pub onboard_temp_id: Option<String>,
}

/// Read-only projection of the current configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigView {
    groups: HashMap<String, GroupConfig>,
    clients: HashMap<String, ClientEntry>,
}

impl ConfigView {
    pub fn new(groups: Vec<GroupConfig>, clients: Vec<ClientEntry>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
            clients: clients.into_iter().map(|c| (c.guid.clone(), c)).collect(),
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupConfig> {
        self.groups.values()
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }

    /// Allow-list lookup: `Some` iff the GUID is known.
    pub fn client(&self, guid: &str) -> Option<&ClientEntry> {
        self.clients.get(guid)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientEntry> {
        self.clients.values()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_config_carries_defaults() {
        let config = GroupConfig::named("kitchen");
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.arbitration_timeout_ms, 200);
        assert_eq!(config.vad_no_voice_ms, 1_000);
        assert_eq!(config.output, OutputKind::File);
        assert!(config.fallback_to_file_on_busy);
    }

    #[test]
    fn output_kind_spells_alsa_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&OutputKind::Device).unwrap(),
            "\"alsa\""
        );
        assert_eq!(serde_json::to_string(&OutputKind::File).unwrap(), "\"file\"");
        let parsed: OutputKind = serde_json::from_str("\"alsa\"").unwrap();
        assert_eq!(parsed, OutputKind::Device);
    }

    #[test]
    fn view_lookups() {
        let view = ConfigView::new(
            vec![GroupConfig::named("kitchen")],
            vec![ClientEntry {
                guid: "g-1".into(),
                group: "kitchen".into(),
                onboard_temp_id: None,
            }],
        );
        assert!(view.group("kitchen").is_some());
        assert!(view.group("attic").is_none());
        assert_eq!(view.client("g-1").unwrap().group, "kitchen");
        assert!(view.client("g-2").is_none());
    }
}
