//! Energy-threshold voice activity detector.
//!
//! Classifies a frame as speech when its RMS level exceeds a fixed threshold. Crude
//! compared to a neural VAD, but it has no failure modes, which is why sessions also
//! use it as the fallback when the configured detector errors.

use crate::adapters::{VadDecision, VoiceActivityDetector};
use crate::audio::frame::AudioFrame;
use crate::error::VoiceResult;

#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS level in [0.0, 1.0] above which a frame counts as speech
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(f32::EPSILON, 1.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Infallible classification, used directly by the detector fallback path.
    pub fn decide(&self, frame: &AudioFrame) -> VadDecision {
        let rms = frame.rms();
        // Map the level onto [0, 1] with the threshold at 0.5
        let probability = (rms / (2.0 * self.threshold)).min(1.0);
        VadDecision {
            is_speech: rms >= self.threshold,
            probability,
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&self, frame: &AudioFrame) -> VoiceResult<VadDecision> {
        Ok(self.decide(frame))
    }

    fn name(&self) -> &str {
        "energy"
    }
}
