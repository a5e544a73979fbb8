/// Editable vibe parameters
///
/// These are the two values a user tunes after importing a vibe. They travel
/// with the envelope when sharing and are stored on the catalog record.

use serde::{Deserialize, Serialize};

/// Parameters that control how strongly a vibe conditions generation
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VibeParams {
    /// Reference strength (0.0 to 1.0)
    /// - 0.0 = the vibe has no effect
    /// - 1.0 = the vibe dominates the result
    pub strength: f64,

    /// Information extracted (0.0 to 1.0)
    /// - Lower values keep only broad style
    /// - 1.0 = keep as much detail as the encoder allows
    /// - Changing this requires re-encoding a raw image
    pub info_extracted: f64,
}

impl Default for VibeParams {
    fn default() -> Self {
        Self {
            strength: 0.6,
            info_extracted: 1.0,
        }
    }
}

impl VibeParams {
    /// Create parameters, clamping both values into range
    pub fn new(strength: f64, info_extracted: f64) -> Self {
        Self {
            strength: clamp_unit(strength),
            info_extracted: clamp_unit(info_extracted),
        }
    }

    /// True when both values are finite and inside [0, 1]
    pub fn is_valid(&self) -> bool {
        is_unit(self.strength) && is_unit(self.info_extracted)
    }

    /// Return a copy with out-of-range values pulled back into [0, 1]
    pub fn clamped(&self) -> Self {
        Self::new(self.strength, self.info_extracted)
    }

    /// Check if this is still the default configuration
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Reset all adjustments to default
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub(crate) fn is_unit(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

fn clamp_unit(v: f64) -> f64 {
    // NaN has no meaningful position in the range; treat it as zero
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let params = VibeParams::default();
        assert!(params.is_valid());
        assert!(params.is_default());
    }

    #[test]
    fn test_new_clamps() {
        let params = VibeParams::new(1.5, -0.2);
        assert_eq!(params.strength, 1.0);
        assert_eq!(params.info_extracted, 0.0);

        let nan = VibeParams::new(f64::NAN, 0.5);
        assert_eq!(nan.strength, 0.0);
    }

    #[test]
    fn test_invalid_detected() {
        let params = VibeParams {
            strength: 2.0,
            info_extracted: 0.5,
        };
        assert!(!params.is_valid());
        assert!(params.clamped().is_valid());
    }

    #[test]
    fn test_reset() {
        let mut params = VibeParams::new(0.1, 0.2);
        assert!(!params.is_default());

        params.reset();

        assert!(params.is_default());
    }
}
