//! Bounds validation for tempo updates.
//!
//! Every path that mutates room state (REST update, channel proposal) runs
//! its input through here first. Validation is all-or-nothing: a rejected
//! update never reaches the registry, so stored state is never partially
//! modified.

use linkjam_types::{TempoPatch, TempoUpdate};

/// Lowest accepted tempo.
pub const BPM_MIN: f64 = 20.0;
/// Highest accepted tempo.
pub const BPM_MAX: f64 = 999.0;
/// Fewest beats per bar.
pub const BPI_MIN: u32 = 1;
/// Most beats per bar.
pub const BPI_MAX: u32 = 64;

/// A field fell outside its allowed range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoundsError {
    /// `bpm` outside `[20, 999]` (or not a finite number).
    #[error("BPM must be between 20 and 999")]
    Bpm {
        /// The rejected value.
        bpm: f64,
    },

    /// `bpi` outside `[1, 64]`.
    #[error("BPI must be between 1 and 64")]
    Bpi {
        /// The rejected value.
        bpi: i64,
    },
}

/// Check a tempo value.
pub fn validate_bpm(bpm: f64) -> Result<f64, BoundsError> {
    if bpm.is_finite() && (BPM_MIN..=BPM_MAX).contains(&bpm) {
        Ok(bpm)
    } else {
        Err(BoundsError::Bpm { bpm })
    }
}

/// Check a beats-per-bar value and narrow it to `u32`.
pub fn validate_bpi(bpi: i64) -> Result<u32, BoundsError> {
    u32::try_from(bpi)
        .ok()
        .filter(|v| (BPI_MIN..=BPI_MAX).contains(v))
        .ok_or(BoundsError::Bpi { bpi })
}

/// Validate a client update into a patch the registry can apply.
pub fn validate_update(update: TempoUpdate) -> Result<TempoPatch, BoundsError> {
    let bpm = update.bpm.map(validate_bpm).transpose()?;
    let bpi = update.bpi.map(validate_bpi).transpose()?;
    Ok(TempoPatch {
        bpm,
        bpi,
        epoch_ms: update.epoch_ms,
        updated_by: update.updated_by,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bpm_bounds_are_inclusive() {
        assert!(validate_bpm(20.0).is_ok());
        assert!(validate_bpm(999.0).is_ok());
        assert!(validate_bpm(19.99).is_err());
        assert!(validate_bpm(1000.0).is_err());
        assert!(validate_bpm(f64::NAN).is_err());
        assert!(validate_bpm(f64::INFINITY).is_err());
    }

    #[test]
    fn bpi_bounds_are_inclusive() {
        assert_eq!(validate_bpi(1).unwrap(), 1);
        assert_eq!(validate_bpi(64).unwrap(), 64);
        assert!(validate_bpi(0).is_err());
        assert!(validate_bpi(65).is_err());
        assert!(validate_bpi(-4).is_err());
        assert!(validate_bpi(i64::MAX).is_err());
    }

    #[test]
    fn rejection_messages() {
        assert_eq!(
            validate_bpm(1000.0).unwrap_err().to_string(),
            "BPM must be between 20 and 999"
        );
        assert_eq!(
            validate_bpi(0).unwrap_err().to_string(),
            "BPI must be between 1 and 64"
        );
    }

    #[test]
    fn update_with_one_bad_field_is_rejected_whole() {
        let update = TempoUpdate {
            bpm: Some(128.0),
            bpi: Some(99),
            ..TempoUpdate::default()
        };
        assert_eq!(validate_update(update), Err(BoundsError::Bpi { bpi: 99 }));
    }

    #[test]
    fn valid_update_becomes_patch() {
        let update = TempoUpdate {
            bpm: Some(128.0),
            bpi: Some(3),
            epoch_ms: Some(77),
            updated_by: Some("dj".to_owned()),
        };
        let patch = validate_update(update).unwrap();
        assert_eq!(patch.bpi, Some(3));
        assert_eq!(patch.epoch_ms, Some(77));
        assert_eq!(patch.updated_by.as_deref(), Some("dj"));
        assert!(validate_update(TempoUpdate::default()).unwrap().is_empty());
    }
}
