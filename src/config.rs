//! Configuration types for the dialogue harness.
//!
//! Values come from an optional TOML file (`PARLEY_CONFIG`) and are then
//! overlaid with the environment variables the dataflow runtime sets per
//! node. Both are read once at startup.

use crate::error::{HarnessError, Result};
use crate::pipeline::messages::SpeakerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";
/// Comma-separated speaker rotation.
pub const TURN_ORDER_ENV: &str = "TURN_ORDER";
/// Participant served by a responder or synth node.
pub const PARTICIPANT_ENV: &str = "PARTICIPANT_ID";
/// Voice label reported by a synth node.
pub const VOICE_ENV: &str = "VOICE_NAME";
/// Participant a bridge node prompts.
pub const BRIDGE_TARGET_ENV: &str = "BRIDGE_TARGET";

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Participant identities and turn order.
    pub speakers: SpeakersConfig,
    /// Sentence segmentation settings.
    pub segmenter: SegmenterConfig,
    /// Turn coordination settings.
    pub coordinator: CoordinatorConfig,
    /// Canned-reply speaker settings.
    pub responder: ResponderConfig,
    /// Synthetic audio timing settings.
    pub synth: SynthConfig,
    /// Conference bridge prompts.
    pub bridge: BridgeConfig,
    /// In-process wiring settings.
    pub dataflow: DataflowConfig,
}

/// Participant identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakersConfig {
    /// Turn rotation; the first entry speaks first.
    pub rotation: Vec<String>,
    /// Participant a single responder/synth node serves.
    pub participant: String,
    /// Participant a single bridge node prompts.
    pub bridge_target: String,
}

impl Default for SpeakersConfig {
    fn default() -> Self {
        Self {
            rotation: vec!["techer".to_owned(), "myself".to_owned()],
            participant: "myself".to_owned(),
            bridge_target: "myself".to_owned(),
        }
    }
}

/// Sentence segmentation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Characters that close a sentence chunk.
    pub punctuation: String,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            punctuation: "。！？.!?，,；".to_owned(),
        }
    }
}

/// Turn coordination configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Delay between an end-of-turn and the next speaker's go signal.
    pub handoff_delay_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            handoff_delay_ms: 500,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn handoff_delay(&self) -> Duration {
        Duration::from_millis(self.handoff_delay_ms)
    }
}

/// Canned-reply speaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Simulated "thinking" time before a reply starts streaming.
    pub think_delay_ms: u64,
    /// Pacing between streamed characters.
    pub char_delay_ms: u64,
    /// Reply lists keyed by participant id.
    pub replies: BTreeMap<String, Vec<String>>,
    /// Participant whose replies are used for ids missing from `replies`.
    pub fallback_participant: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        let mut replies = BTreeMap::new();
        replies.insert(
            "myself".to_owned(),
            vec![
                "你好！我是学生小明，很高兴参加今天的讨论。".to_owned(),
                "我认为这个话题非常有趣。让我分享一下我的观点。".to_owned(),
                "从我的角度来看，这个问题有很多方面需要考虑。".to_owned(),
                "我同意老师的看法，这确实是一个重要的问题。".to_owned(),
                "让我补充一点，我觉得我们还需要考虑实际应用场景。".to_owned(),
            ],
        );
        replies.insert(
            "techer".to_owned(),
            vec![
                "同学们好！今天我们来讨论一个有趣的话题。".to_owned(),
                "很好的问题！让我从专业角度来解释一下。".to_owned(),
                "这个观点很有见地。我来补充一些背景知识。".to_owned(),
                "大家说得都很好。让我总结一下关键要点。".to_owned(),
                "非常精彩的讨论！希望大家继续保持学习热情。".to_owned(),
            ],
        );
        Self {
            think_delay_ms: 500,
            char_delay_ms: 20,
            replies,
            fallback_participant: "myself".to_owned(),
        }
    }
}

impl ResponderConfig {
    #[must_use]
    pub fn think_delay(&self) -> Duration {
        Duration::from_millis(self.think_delay_ms)
    }

    #[must_use]
    pub fn char_delay(&self) -> Duration {
        Duration::from_millis(self.char_delay_ms)
    }

    /// Reply list for `speaker`, or the fallback participant's list.
    #[must_use]
    pub fn replies_for(&self, speaker: &SpeakerId) -> Vec<String> {
        self.replies
            .get(speaker.as_str())
            .or_else(|| self.replies.get(&self.fallback_participant))
            .cloned()
            .unwrap_or_default()
    }
}

/// Synthetic audio timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u16,
    /// Seconds of audio per input character.
    pub duration_per_char_secs: f64,
    /// Seconds of simulated processing per input character.
    pub processing_per_char_secs: f64,
    /// Upper bound on simulated processing time.
    pub max_processing_secs: f64,
    /// Voice label reported in audio metadata.
    pub voice: String,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            channels: 1,
            duration_per_char_secs: 0.05,
            processing_per_char_secs: 0.01,
            max_processing_secs: 1.0,
            voice: "Default".to_owned(),
        }
    }
}

/// Conference bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Opening prompt per target participant.
    pub prompts: BTreeMap<String, String>,
    /// Prompt for targets missing from `prompts`.
    pub default_prompt: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let mut prompts = BTreeMap::new();
        prompts.insert("myself".to_owned(), "请分享你对这个话题的看法。".to_owned());
        prompts.insert("techer".to_owned(), "请开始今天的讨论。".to_owned());
        Self {
            prompts,
            default_prompt: "请开始今天的讨论。".to_owned(),
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn prompt_for(&self, target: &SpeakerId) -> &str {
        self.prompts
            .get(target.as_str())
            .map_or(self.default_prompt.as_str(), String::as_str)
    }
}

/// In-process wiring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataflowConfig {
    /// Inbox capacity of each node.
    pub event_capacity: usize,
}

impl Default for DataflowConfig {
    fn default() -> Self {
        Self {
            event_capacity: crate::node::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| HarnessError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the startup configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `PARLEY_CONFIG` names an unreadable file or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(order) = lookup(TURN_ORDER_ENV) {
            let rotation: Vec<String> = order
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            if !rotation.is_empty() {
                self.speakers.rotation = rotation;
            }
        }
        if let Some(participant) = lookup(PARTICIPANT_ENV) {
            self.speakers.participant = participant.trim().to_owned();
        }
        if let Some(target) = lookup(BRIDGE_TARGET_ENV) {
            self.speakers.bridge_target = target.trim().to_owned();
        }
        if let Some(voice) = lookup(VOICE_ENV) {
            self.synth.voice = voice;
        }
    }

    /// Reject configurations the nodes cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.speakers.rotation.is_empty() {
            return Err(HarnessError::Config("speaker rotation is empty".to_owned()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for speaker in &self.speakers.rotation {
            if !seen.insert(speaker.as_str()) {
                return Err(HarnessError::Config(format!(
                    "speaker {speaker} appears twice in the rotation"
                )));
            }
        }
        if self.segmenter.punctuation.is_empty() {
            return Err(HarnessError::Config(
                "segmenter punctuation set is empty".to_owned(),
            ));
        }
        if self.synth.sample_rate == 0 || self.synth.channels == 0 {
            return Err(HarnessError::Config(
                "synth sample rate and channel count must be positive".to_owned(),
            ));
        }
        let per_char = [
            self.synth.duration_per_char_secs,
            self.synth.processing_per_char_secs,
            self.synth.max_processing_secs,
        ];
        if per_char.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(HarnessError::Config(
                "synth timing constants must be finite and non-negative".to_owned(),
            ));
        }
        if self.responder.replies.values().any(Vec::is_empty) {
            return Err(HarnessError::Config(
                "responder reply lists must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Speaker rotation as typed identities.
    #[must_use]
    pub fn rotation(&self) -> Vec<SpeakerId> {
        self.speakers
            .rotation
            .iter()
            .map(|s| SpeakerId::new(s.as_str()))
            .collect()
    }

    #[must_use]
    pub fn participant(&self) -> SpeakerId {
        SpeakerId::new(self.speakers.participant.as_str())
    }

    #[must_use]
    pub fn bridge_target(&self) -> SpeakerId {
        SpeakerId::new(self.speakers.bridge_target.as_str())
    }
}
