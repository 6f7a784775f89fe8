//! `EcuConfig`: the firmware's single TOML configuration file, covering
//! tooth wheel geometry, cylinder TDC layout, fuel/lambda/LTFT parameters,
//! safety thresholds and their hysteresis, and persistence/watchdog timing.
//!
//! Deserialized with `serde`/`toml` via `ecu_common::config::ConfigLoader`;
//! every field is checked against a physically-reasoned range at load time
//! and rejected wholesale via `ConfigError::ValidationError` rather than
//! silently clamped.

use serde::{Deserialize, Serialize};

use ecu_common::config::ConfigError;
use ecu_common::consts::{
    CYLINDER_COUNT, LTFT_ALPHA, LTFT_APPLY_THRESHOLD, LTFT_STABILITY_WINDOW_MS,
    PERSIST_THROTTLE_MS, REQ_FUEL_US, SAFETY_CLEAR_HOLDOFF_MS, SAFETY_OVERHEAT_CLT_C,
    SAFETY_OVER_REV_CLEAR_RPM, SAFETY_OVER_REV_RPM, SAFETY_VBAT_MAX_DV, SAFETY_VBAT_MIN_DV,
    WATCHDOG_TIMEOUT_MS,
};

/// Lambda PI controller gains and limits, loaded from `[lambda]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaConfig {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain.
    pub ki: f32,
    /// Derivative gain.
    pub kd: f32,
    /// Symmetric STFT clamp.
    pub stft_limit: f32,
}

impl Default for LambdaConfig {
    fn default() -> Self {
        Self {
            kp: 0.6,
            ki: 0.08,
            kd: 0.01,
            stft_limit: 0.25,
        }
    }
}

/// LTFT integration parameters, loaded from `[ltft]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LtftConfig {
    /// Integration rate toward STFT per stable interval.
    pub alpha: f32,
    /// Magnitude beyond which a VE-table write-back is triggered.
    pub apply_threshold: f32,
    /// Stability window, in ms, before integration may occur.
    pub stability_window_ms: u64,
}

impl Default for LtftConfig {
    fn default() -> Self {
        Self {
            alpha: LTFT_ALPHA,
            apply_threshold: LTFT_APPLY_THRESHOLD,
            stability_window_ms: LTFT_STABILITY_WINDOW_MS,
        }
    }
}

/// Safety thresholds and de-assert hysteresis, loaded from `[safety]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Over-rev limp-mode trip threshold, rpm.
    pub over_rev_rpm: u16,
    /// Over-rev de-assert threshold, rpm.
    pub over_rev_clear_rpm: u16,
    /// Overheat limp-mode trip threshold, °C.
    pub overheat_clt_c: i16,
    /// Battery-voltage valid range, low, V × 10.
    pub vbat_min_dv: u16,
    /// Battery-voltage valid range, high, V × 10.
    pub vbat_max_dv: u16,
    /// De-assert holdoff, all checks healthy, ms.
    pub clear_holdoff_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            over_rev_rpm: SAFETY_OVER_REV_RPM,
            over_rev_clear_rpm: SAFETY_OVER_REV_CLEAR_RPM,
            overheat_clt_c: SAFETY_OVERHEAT_CLT_C,
            vbat_min_dv: SAFETY_VBAT_MIN_DV,
            vbat_max_dv: SAFETY_VBAT_MAX_DV,
            clear_holdoff_ms: SAFETY_CLEAR_HOLDOFF_MS,
        }
    }
}

/// Top-level firmware configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuConfig {
    /// Physical tooth count on the crank wheel (`N`); logical positions are `N+2`.
    pub tooth_count_total: u16,
    /// Cylinder TDC angles in the 720° domain, one per cylinder.
    pub cyl_tdc_deg: [f32; CYLINDER_COUNT],
    /// Base injector constant, µs at 100% VE, 100 kPa, λ=1.
    pub req_fuel_us: f32,
    /// Calibrated end-of-injection target, degrees relative to cylinder TDC.
    pub target_eoi_deg: f32,
    /// End-of-injection target used by the degraded (360°) fallback schedule.
    pub target_eoi_fallback_deg: f32,
    /// Lambda PI controller parameters.
    pub lambda: LambdaConfig,
    /// LTFT integration parameters.
    pub ltft: LtftConfig,
    /// Safety thresholds and hysteresis.
    pub safety: SafetyConfig,
    /// Minimum interval, in ms, between successive map persistence writes.
    pub persist_throttle_ms: u64,
    /// Software watchdog feed timeout, in ms.
    pub watchdog_timeout_ms: u64,
    /// Directory backing the key/value persistence store.
    pub store_path: String,
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            tooth_count_total: 58,
            cyl_tdc_deg: [0.0, 180.0, 360.0, 540.0],
            req_fuel_us: REQ_FUEL_US,
            target_eoi_deg: 5.0,
            target_eoi_fallback_deg: 5.0,
            lambda: LambdaConfig::default(),
            ltft: LtftConfig::default(),
            safety: SafetyConfig::default(),
            persist_throttle_ms: PERSIST_THROTTLE_MS,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT_MS,
            store_path: ecu_common::consts::DEFAULT_STORE_PATH.to_string(),
        }
    }
}

impl EcuConfig {
    /// Validate physically-reasoned bounds on every field. Rejects the
    /// config wholesale on the first violation rather than clamping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8..=200).contains(&self.tooth_count_total) {
            return Err(ConfigError::ValidationError(format!(
                "tooth_count_total {} out of range [8, 200]",
                self.tooth_count_total
            )));
        }
        for (i, &deg) in self.cyl_tdc_deg.iter().enumerate() {
            if !(0.0..720.0).contains(&deg) {
                return Err(ConfigError::ValidationError(format!(
                    "cyl_tdc_deg[{i}] = {deg} out of range [0, 720)"
                )));
            }
        }
        for i in 0..self.cyl_tdc_deg.len() {
            for j in (i + 1)..self.cyl_tdc_deg.len() {
                if (self.cyl_tdc_deg[i] - self.cyl_tdc_deg[j]).abs() < 1.0 {
                    return Err(ConfigError::ValidationError(format!(
                        "cyl_tdc_deg[{i}] and [{j}] overlap"
                    )));
                }
            }
        }
        if !(1000.0..20000.0).contains(&self.req_fuel_us) {
            return Err(ConfigError::ValidationError(format!(
                "req_fuel_us {} out of range [1000, 20000]",
                self.req_fuel_us
            )));
        }
        if self.safety.over_rev_clear_rpm >= self.safety.over_rev_rpm {
            return Err(ConfigError::ValidationError(
                "safety.over_rev_clear_rpm must be below safety.over_rev_rpm".into(),
            ));
        }
        if self.safety.vbat_min_dv >= self.safety.vbat_max_dv {
            return Err(ConfigError::ValidationError(
                "safety.vbat_min_dv must be below safety.vbat_max_dv".into(),
            ));
        }
        if self.lambda.stft_limit <= 0.0 || self.lambda.stft_limit > 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "lambda.stft_limit {} out of range (0, 1]",
                self.lambda.stft_limit
            )));
        }
        if self.ltft.apply_threshold <= 0.0 || self.ltft.apply_threshold > self.lambda.stft_limit {
            return Err(ConfigError::ValidationError(
                "ltft.apply_threshold must be in (0, lambda.stft_limit]".into(),
            ));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "watchdog_timeout_ms must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Persisted end-of-injection calibration, taking over from
/// `EcuConfig::target_eoi_deg`/`target_eoi_fallback_deg` once a record has
/// been written to the key/value store under `"eoi_config"`.
///
/// `crc32` guards the record's own fields against in-memory corruption
/// before a write, the same role `Table16x16::checksum` plays for cell
/// data; the persistence layer's outer CRC-32 framing separately guards
/// the serialized bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EoiConfigRecord {
    /// Record schema version, for forward-compatible migrations.
    pub version: u16,
    /// Calibrated end-of-injection target, full-sync schedule.
    pub eoi_deg: f32,
    /// End-of-injection target used by the degraded (360°) fallback schedule.
    pub eoi_fallback_deg: f32,
    /// CRC-32/Ethernet over `version`, `eoi_deg`, `eoi_fallback_deg`.
    pub crc32: u32,
}

impl EoiConfigRecord {
    /// Build a record from `eoi_deg`/`eoi_fallback_deg`, with a valid checksum.
    pub fn new(eoi_deg: f32, eoi_fallback_deg: f32) -> Self {
        let mut record = Self {
            version: 1,
            eoi_deg,
            eoi_fallback_deg,
            crc32: 0,
        };
        record.recompute_checksum();
        record
    }

    fn checksum_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.eoi_deg.to_le_bytes());
        buf.extend_from_slice(&self.eoi_fallback_deg.to_le_bytes());
        buf
    }

    /// Recompute the checksum over the current field values.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.checksum_bytes())
    }

    /// `true` iff the stored checksum matches the recomputed one.
    pub fn is_valid(&self) -> bool {
        self.crc32 == self.compute_checksum()
    }

    /// Recompute and store the checksum. Call after any field mutation.
    pub fn recompute_checksum(&mut self) {
        self.crc32 = self.compute_checksum();
    }
}

/// Persisted closed-loop lambda control enablement, taking over from any
/// static default once a record has been written under `"closed_loop_cfg"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosedLoopConfigRecord {
    /// Record schema version, for forward-compatible migrations.
    pub version: u16,
    /// Whether closed-loop lambda trim is permitted at all (independent of
    /// the per-cycle limp-mode override, which always forces it off).
    pub enabled: bool,
    /// Reserved for future flags; always zero today.
    pub reserved: u16,
    /// CRC-32/Ethernet over `version`, `enabled`, `reserved`.
    pub crc32: u32,
}

impl ClosedLoopConfigRecord {
    /// Build a record with `enabled` set, a valid checksum, `reserved = 0`.
    pub fn new(enabled: bool) -> Self {
        let mut record = Self {
            version: 1,
            enabled,
            reserved: 0,
            crc32: 0,
        };
        record.recompute_checksum();
        record
    }

    fn checksum_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.enabled as u8);
        buf.extend_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    /// Recompute the checksum over the current field values.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.checksum_bytes())
    }

    /// `true` iff the stored checksum matches the recomputed one.
    pub fn is_valid(&self) -> bool {
        self.crc32 == self.compute_checksum()
    }

    /// Recompute and store the checksum. Call after any field mutation.
    pub fn recompute_checksum(&mut self) {
        self.crc32 = self.compute_checksum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecu_common::config::ConfigLoader;

    #[test]
    fn default_config_validates() {
        assert!(EcuConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_overlapping_tdc_angles() {
        let mut cfg = EcuConfig::default();
        cfg.cyl_tdc_deg[1] = cfg.cyl_tdc_deg[0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_over_rev_hysteresis() {
        let mut cfg = EcuConfig::default();
        cfg.safety.over_rev_clear_rpm = cfg.safety.over_rev_rpm + 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_vbat_range() {
        let mut cfg = EcuConfig::default();
        cfg.safety.vbat_min_dv = cfg.safety.vbat_max_dv + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_tooth_count() {
        let mut cfg = EcuConfig::default();
        cfg.tooth_count_total = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = EcuConfig::default();
        let toml_str = toml::to_string(&cfg).unwrap();
        let parsed = EcuConfig::load_from_str(&toml_str).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn eoi_config_record_has_valid_checksum() {
        let record = EoiConfigRecord::new(5.0, 7.5);
        assert!(record.is_valid());
    }

    #[test]
    fn eoi_config_record_tampered_field_fails_checksum() {
        let mut record = EoiConfigRecord::new(5.0, 7.5);
        record.eoi_deg = 99.0;
        assert!(!record.is_valid());
    }

    #[test]
    fn eoi_config_record_round_trips_through_json() {
        let record = EoiConfigRecord::new(5.0, 7.5);
        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: EoiConfigRecord = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(record, decoded);
        assert!(decoded.is_valid());
    }

    #[test]
    fn closed_loop_config_record_has_valid_checksum() {
        let record = ClosedLoopConfigRecord::new(true);
        assert!(record.is_valid());
    }

    #[test]
    fn closed_loop_config_record_tampered_field_fails_checksum() {
        let mut record = ClosedLoopConfigRecord::new(true);
        record.enabled = false;
        assert!(!record.is_valid());
    }
}
