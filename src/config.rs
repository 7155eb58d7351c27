use std::env;

use crate::lagcorr::{ConfidenceLevel, LagConfig};

/// Engine configuration with environment overrides.
///
/// Every field has a working default; deployments tune them through
/// `GWSIG_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sakoe-Chiba band half-width for DTW, in grid steps. `None` means the
    /// full warping window (the baseline contract).
    pub dtw_band: Option<usize>,
    /// Minimum overlapping points for a lag to enter the correlation table.
    pub min_overlap: usize,
    /// Confidence level for Fisher-z intervals on Pearson R.
    pub confidence: ConfidenceLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dtw_band: None,
            min_overlap: 3,
            confidence: ConfidenceLevel::P95,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Set but unparseable values are
    /// also ignored, with a warning, so a bad override cannot take the
    /// engine down.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = env::var("GWSIG_DTW_BAND") {
            match raw.trim().parse::<usize>() {
                Ok(band) => config.dtw_band = Some(band),
                Err(_) => log::warn!("ignoring unparseable GWSIG_DTW_BAND={}", raw),
            }
        }

        if let Ok(raw) = env::var("GWSIG_MIN_OVERLAP") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n >= 2 => config.min_overlap = n,
                _ => log::warn!("ignoring unparseable GWSIG_MIN_OVERLAP={}", raw),
            }
        }

        if let Ok(raw) = env::var("GWSIG_CONFIDENCE") {
            match ConfidenceLevel::parse(raw.trim()) {
                Some(level) => config.confidence = level,
                None => log::warn!("ignoring unparseable GWSIG_CONFIDENCE={}", raw),
            }
        }

        config
    }

    /// Lag-sweep parameters at this engine's overlap and confidence
    /// settings.
    pub fn lag_config(&self, max_lag: usize, step: usize) -> LagConfig {
        LagConfig {
            max_lag,
            step,
            min_overlap: self.min_overlap,
            confidence: self.confidence,
        }
    }
}
