//! System-wide constants for the ECU workspace.
//!
//! Single source of truth for all numeric limits, fixed-point scale factors,
//! and default paths. Imported by all crates — no duplication permitted.

/// Number of cylinders this firmware is built for.
pub const CYLINDER_COUNT: usize = 4;

/// Crank-rev domain size in degrees (two revolutions per 4-stroke cycle).
pub const FULL_CYCLE_DEG: f32 = 720.0;

/// Crank-rev domain size in degrees for degraded (360°) fallback scheduling.
pub const HALF_CYCLE_DEG: f32 = 360.0;

/// Size of one axis of a lookup table (rpm or load bins).
pub const TABLE_AXIS_LEN: usize = 16;

/// Free-running hardware counter wrap period, in microseconds (30 s).
pub const COUNTER_WRAP_US: u32 = 30_000_000;

/// Half of the `u32` tick space — threshold for wrap-aware "in the future" comparison.
pub const HALF_WRAP: u32 = 1 << 31;

/// Minimum lead time, in microseconds, an `arm()` target must clear the current counter by.
pub const MIN_LEAD_US: u32 = 50;

/// Window, in microseconds, within which a rearm of an already-armed channel is refused
/// as a `rearm_collision` rather than silently overwriting the pending edge.
pub const REARM_COLLISION_WINDOW_US: u32 = 200;

/// Fixed-point scale factor for degrees and VE values (×10).
pub const SCALE_DEG_VE: i32 = 10;

/// Fixed-point scale factor for lambda values (×1000).
pub const SCALE_LAMBDA: i32 = 1000;

/// `REQ_FUEL_US` — base injector constant, microseconds at 100% VE, 100 kPa, λ=1.
pub const REQ_FUEL_US: f32 = 7730.0;

/// Minimum clamped pulse width, in microseconds.
pub const PW_MIN_US: u32 = 500;

/// Maximum clamped pulse width, in microseconds.
pub const PW_MAX_US: u32 = 18_000;

/// Coolant temperature, in °C, at or below which warmup enrichment saturates at its maximum.
pub const WARMUP_TEMP_MIN_C: i16 = 0;

/// Coolant temperature, in °C, at or above which warmup enrichment has fully decayed to 1.0.
pub const WARMUP_TEMP_MAX_C: i16 = 70;

/// Warmup enrichment factor at or below [`WARMUP_TEMP_MIN_C`].
pub const WARMUP_FACTOR_MAX: f32 = 1.40;

/// Warmup enrichment factor at or above [`WARMUP_TEMP_MAX_C`].
pub const WARMUP_FACTOR_MIN: f32 = 1.00;

/// Lambda correction clamp, applied as `clamp(1 + lambda_corr, ..)`.
pub const LAMBDA_FACTOR_MIN: f32 = 0.75;
/// See [`LAMBDA_FACTOR_MIN`].
pub const LAMBDA_FACTOR_MAX: f32 = 1.25;

/// Short-term fuel trim clamp, symmetric.
pub const STFT_LIMIT: f32 = 0.25;
/// Long-term fuel trim clamp, symmetric.
pub const LTFT_LIMIT: f32 = 0.20;
/// LTFT integration rate toward STFT, per stable 500 ms interval.
pub const LTFT_ALPHA: f32 = 0.01;
/// Magnitude of LTFT beyond which a VE-table write-back is triggered.
pub const LTFT_APPLY_THRESHOLD: f32 = 0.03;
/// Window, in ms, an operating point must hold steady before LTFT may integrate.
pub const LTFT_STABILITY_WINDOW_MS: u64 = 500;
/// Maximum allowed `|Δrpm|` within the stability window.
pub const LTFT_STABLE_RPM_DELTA: u16 = 50;
/// Maximum allowed `|Δload|` within the stability window.
pub const LTFT_STABLE_LOAD_DELTA: u16 = 50;

/// Minimum throttle interval, in ms, between successive map persistence writes.
pub const PERSIST_THROTTLE_MS: u64 = 5000;

/// External wideband lambda reading is considered stale beyond this age.
pub const LAMBDA_EXTERNAL_MAX_AGE_MS: u32 = 200;

/// Narrowband O2 sensor stoichiometric reference voltage divisor (mV → λ).
pub const NARROWBAND_LAMBDA_DIVISOR: f32 = 0.45;
/// Narrowband-derived lambda clamp range, low.
pub const NARROWBAND_LAMBDA_MIN: f32 = 0.7;
/// Narrowband-derived lambda clamp range, high.
pub const NARROWBAND_LAMBDA_MAX: f32 = 1.3;

/// Maximum physically sane RPM; schedule math clamps to this.
pub const RPM_MAX_SAFE: u16 = 12_000;

/// Over-rev limp-mode trip threshold.
pub const SAFETY_OVER_REV_RPM: u16 = 7_500;
/// Over-rev limp-mode de-assert threshold (hysteresis).
pub const SAFETY_OVER_REV_CLEAR_RPM: u16 = 6_800;
/// Overheat limp-mode trip threshold, °C.
pub const SAFETY_OVERHEAT_CLT_C: i16 = 120;
/// Battery-voltage limp-mode valid range, low (V × 10).
pub const SAFETY_VBAT_MIN_DV: u16 = 70;
/// Battery-voltage limp-mode valid range, high (V × 10).
pub const SAFETY_VBAT_MAX_DV: u16 = 170;
/// Time all safety checks must read healthy before limp mode de-asserts.
pub const SAFETY_CLEAR_HOLDOFF_MS: u64 = 2_000;

/// Advance clamp applied while in limp mode.
pub const LIMP_ADVANCE_DEG: f32 = 10.0;

/// Software watchdog feed timeout; missing a feed for longer than this trips limp mode.
pub const WATCHDOG_TIMEOUT_MS: u64 = 1_000;

/// Control cycle period (LTFT integration, persistence throttle).
pub const CONTROL_CYCLE_US: u64 = 1_000;

/// Default path to the persisted calibration key/value store directory.
pub const DEFAULT_STORE_PATH: &str = "/etc/ecu/store";

/// Default path to the firmware's TOML configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ecu/ecu.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(CYLINDER_COUNT == 4);
        assert_eq!(FULL_CYCLE_DEG, 2.0 * HALF_CYCLE_DEG);
        assert!(PW_MIN_US < PW_MAX_US);
        assert!(WARMUP_TEMP_MIN_C < WARMUP_TEMP_MAX_C);
        assert!(WARMUP_FACTOR_MAX > WARMUP_FACTOR_MIN);
        assert!(SAFETY_OVER_REV_CLEAR_RPM < SAFETY_OVER_REV_RPM);
        assert!(SAFETY_VBAT_MIN_DV < SAFETY_VBAT_MAX_DV);
    }

    #[test]
    fn half_wrap_is_half_of_u32_space() {
        assert_eq!(HALF_WRAP, u32::MAX / 2 + 1);
    }
}
