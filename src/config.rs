//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs deserialize from TOML, environment variables and JSON
//! - **Enums as config values**: backend and policy choices are closed sets, so a typo
//!   in `config.toml` fails at load time instead of at the first session
//!
//! ## Configuration Priority (highest to lowest):
//! 1. HOST / PORT environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_SESSION__VAD_HANGOVER_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## Runtime updates:
//! `PUT /api/v1/config` merges a partial JSON document into the live configuration.
//! Sessions copy their configuration at construction, so updates only affect new sessions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::audio::buffer::FrameBufferConfig;
use crate::audio::segmenter::SegmenterConfig;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub backends: BackendsConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// What to do when the dialogue engine fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueFallbackPolicy {
    /// Skip the turn and go back to listening
    Silent,
    /// Speak `fallback_reply_text` instead
    Apology,
}

/// How a frame is classified when the VAD backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorFallback {
    /// Use the RMS energy heuristic
    Energy,
    /// Treat the frame as silence
    Silence,
}

/// Per-session tuning. Copied into each session at construction.
///
/// ## Timing fields:
/// All durations are in milliseconds. Hangover is converted to a frame count with
/// `hangover_frames()`, rounding up so a pause is never shorter than configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Duration of one inbound frame
    pub frame_ms: u32,
    pub sample_rate: u32,
    /// Audio kept ahead of speech-start and prepended to each utterance
    pub pre_roll_ms: u64,
    /// Consecutive speech frames before speech-start is declared
    pub vad_attack_frames: u32,
    /// Continuous silence before speech-end is declared
    pub vad_hangover_ms: u64,
    /// Utterances shorter than this are discarded as noise
    pub min_utterance_ms: u64,
    /// Longest single utterance before an end is forced
    pub max_buffer_ms: u64,
    pub barge_in_enabled: bool,
    pub silence_timeout_ms: u64,
    /// Whether a silence timeout ends the session (otherwise it is only reported)
    pub end_session_on_silence: bool,
    pub dialogue_fallback_policy: DialogueFallbackPolicy,
    pub fallback_reply_text: String,
    pub detector_fallback: DetectorFallback,
    /// Pipe dialogue tokens into the synthesizer as they arrive
    pub stream_reply: bool,
    /// Release synthesized frames at playback speed instead of as fast as they arrive
    pub realtime_playout: bool,
    /// How long a cancelled worker may take to stop
    pub cancellation_timeout_ms: u64,
    pub transcription_timeout_ms: u64,
    pub dialogue_timeout_ms: u64,
    /// Longest gap allowed between two synthesized frames
    pub synthesis_timeout_ms: u64,
    /// How long a graceful close waits for an in-flight reply to finish playing
    pub drain_timeout_ms: u64,
    /// Capacity of the inbound frame queue
    pub inbound_queue_frames: usize,
    pub system_preamble: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_ms: 30,
            sample_rate: 16000,
            pre_roll_ms: 300,
            vad_attack_frames: 3,
            vad_hangover_ms: 300,
            min_utterance_ms: 250,
            max_buffer_ms: 30_000,
            barge_in_enabled: true,
            silence_timeout_ms: 30_000,
            end_session_on_silence: false,
            dialogue_fallback_policy: DialogueFallbackPolicy::Silent,
            fallback_reply_text: "Sorry, I didn't catch that. Could you say it again?".to_string(),
            detector_fallback: DetectorFallback::Energy,
            stream_reply: false,
            realtime_playout: true,
            cancellation_timeout_ms: 500,
            transcription_timeout_ms: 10_000,
            dialogue_timeout_ms: 15_000,
            synthesis_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
            inbound_queue_frames: 256,
            system_preamble: "You are a helpful voice assistant. Keep your answers short and conversational."
                .to_string(),
        }
    }
}

impl SessionConfig {
    /// Number of silent frames that make up the hangover (at least one).
    pub fn hangover_frames(&self) -> u32 {
        if self.frame_ms == 0 {
            return 1;
        }
        let frames = self.vad_hangover_ms.div_ceil(self.frame_ms as u64);
        frames.clamp(1, u32::MAX as u64) as u32
    }

    pub fn buffer_config(&self) -> FrameBufferConfig {
        FrameBufferConfig {
            pre_roll_ms: self.pre_roll_ms,
            max_buffer_ms: self.max_buffer_ms,
        }
    }

    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            attack_frames: self.vad_attack_frames,
            hangover_frames: self.hangover_frames(),
            barge_in_enabled: self.barge_in_enabled,
        }
    }

    pub fn cancellation_timeout(&self) -> Duration {
        Duration::from_millis(self.cancellation_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_millis(self.transcription_timeout_ms)
    }

    pub fn dialogue_timeout(&self) -> Duration {
        Duration::from_millis(self.dialogue_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Apply per-session overrides (a partial JSON object) on top of this config.
    ///
    /// ## Example:
    /// `{"barge_in_enabled": false, "silence_timeout_ms": 5000}`
    pub fn with_overrides(&self, overrides: &serde_json::Value) -> Result<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, overrides);
        let config: SessionConfig = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_ms == 0 {
            return Err(anyhow::anyhow!("Frame duration must be greater than 0"));
        }
        if self.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }
        if self.vad_attack_frames == 0 {
            return Err(anyhow::anyhow!("VAD attack frames must be greater than 0"));
        }
        if self.vad_hangover_ms < self.frame_ms as u64 {
            return Err(anyhow::anyhow!(
                "VAD hangover ({}ms) must be at least one frame ({}ms)",
                self.vad_hangover_ms,
                self.frame_ms
            ));
        }
        if self.pre_roll_ms < self.vad_attack_frames as u64 * self.frame_ms as u64 {
            return Err(anyhow::anyhow!(
                "Pre-roll ({}ms) must cover the attack window ({} frames)",
                self.pre_roll_ms,
                self.vad_attack_frames
            ));
        }
        if self.max_buffer_ms <= self.min_utterance_ms {
            return Err(anyhow::anyhow!(
                "Max buffer ({}ms) must be greater than min utterance ({}ms)",
                self.max_buffer_ms,
                self.min_utterance_ms
            ));
        }
        if self.cancellation_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Cancellation timeout must be greater than 0"));
        }
        if self.inbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Inbound queue must hold at least one frame"));
        }
        if self.dialogue_fallback_policy == DialogueFallbackPolicy::Apology
            && self.fallback_reply_text.trim().is_empty()
        {
            return Err(anyhow::anyhow!("Apology fallback requires a fallback reply text"));
        }
        Ok(())
    }
}

/// Which VAD implementation sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadBackend {
    Energy,
}

/// Which dialogue engine sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueBackend {
    #[serde(rename = "openai")]
    OpenAi,
    /// Repeats the user's words back; useful for wiring checks without an LLM
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub vad: VadBackend,
    pub dialogue: DialogueBackend,
    /// RMS level (0.0-1.0) above which the energy detector reports speech
    pub energy_threshold: f32,
    pub openai: OpenAiConfig,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            vad: VadBackend::Energy,
            dialogue: DialogueBackend::OpenAi,
            energy_threshold: 0.02,
            openai: OpenAiConfig::default(),
        }
    }
}

/// Settings for any OpenAI-compatible endpoint (OpenAI itself, a local server, a proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: String,
    /// Falls back to the OPENAI_API_KEY environment variable when empty
    pub api_key: String,
    pub stt_model: String,
    pub llm_model: String,
    pub tts_model: String,
    pub voice: String,
    /// Sample rate of the raw PCM returned by the speech endpoint
    pub tts_sample_rate: u32,
    pub request_timeout_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            stt_model: "whisper-1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            tts_sample_rate: 24000,
            request_timeout_ms: 30_000,
        }
    }
}

impl OpenAiConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// How long closed sessions stay visible in the session list
    pub closed_session_ttl_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            closed_session_ttl_secs: 300,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__BARGE_IN_ENABLED=false`: Disable barge-in
    /// - `APP_BACKENDS__OPENAI__BASE_URL=http://localhost:8000/v1`: Use a local server
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Single underscores appear inside field names, so nesting uses a double one
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if !(self.backends.energy_threshold > 0.0 && self.backends.energy_threshold <= 1.0) {
            return Err(anyhow::anyhow!("Energy threshold must be in (0.0, 1.0]"));
        }

        if self.backends.openai.tts_sample_rate == 0 {
            return Err(anyhow::anyhow!("TTS sample rate must be greater than 0"));
        }

        self.session.validate()
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the provided keys change, at any nesting depth. For example
    /// `{"session": {"silence_timeout_ms": 10000}}` leaves every other value alone.
    /// The update is applied atomically: if the merged result fails validation,
    /// nothing changes.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial_config.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &partial_config);
        let updated: AppConfig = serde_json::from_value(merged)?;

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// A copy safe to return over the API (secrets blanked).
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.backends.openai.api_key.is_empty() {
            copy.backends.openai.api_key = "***".to_string();
        }
        copy
    }
}

/// Recursively merge `patch` into `target`. Objects merge key by key; anything else replaces.
fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.hangover_frames(), 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.vad_hangover_ms = 10;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.max_buffer_ms = config.session.min_utterance_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hangover_rounds_up() {
        let session = SessionConfig {
            frame_ms: 20,
            vad_hangover_ms: 250,
            ..SessionConfig::default()
        };
        assert_eq!(session.hangover_frames(), 13);
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "session": {"dialogue_fallback_policy": "apology"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.session.dialogue_fallback_policy, DialogueFallbackPolicy::Apology);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.session.frame_ms, 30);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "session": {"vad_attack_frames": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.vad_attack_frames, 3);
    }

    #[test]
    fn test_session_overrides() {
        let base = SessionConfig::default();
        let overrides = serde_json::json!({"barge_in_enabled": false, "silence_timeout_ms": 5000});
        let session = base.with_overrides(&overrides).unwrap();
        assert!(!session.barge_in_enabled);
        assert_eq!(session.silence_timeout_ms, 5000);
        assert_eq!(session.frame_ms, base.frame_ms);

        let bad = serde_json::json!({"dialogue_fallback_policy": "shout"});
        assert!(base.with_overrides(&bad).is_err());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.backends.openai.api_key = "sk-secret".to_string();
        assert_eq!(config.redacted().backends.openai.api_key, "***");
    }
}
