//! `LambdaController`: closed-loop lambda PI control producing short-term
//! fuel trim (STFT), integrated into long-term fuel trim (LTFT) once an
//! operating point has held steady, with threshold-triggered VE-table
//! write-back.
//!
//! Shares the gains/integrator-state split common to PI/PID controllers but
//! implements the exact PI algebra and trim-integration semantics called for
//! here, not a generic derivative-filtered anti-windup PID.

use std::sync::Mutex;

use ecu_common::consts::{
    LAMBDA_EXTERNAL_MAX_AGE_MS, LTFT_ALPHA, LTFT_APPLY_THRESHOLD, LTFT_LIMIT,
    LTFT_STABILITY_WINDOW_MS, LTFT_STABLE_LOAD_DELTA, LTFT_STABLE_RPM_DELTA,
    NARROWBAND_LAMBDA_DIVISOR, NARROWBAND_LAMBDA_MAX, NARROWBAND_LAMBDA_MIN, STFT_LIMIT,
};

/// Single-slot holder for the most recent external wideband lambda reading,
/// written by whatever task polls that sensor and read once per cycle by
/// `CoreController::on_cycle_tick`.
///
/// A plain `Mutex` suffices here (unlike `SensorSeqlock`): the external
/// reading arrives far slower than tooth events, so lock contention on a
/// once-per-millisecond read/write pair is not a real-time concern.
#[derive(Debug, Default)]
pub struct ExternalLambdaInput {
    reading: Mutex<Option<(u16, u64)>>,
}

impl ExternalLambdaInput {
    /// An empty slot: no external reading has ever arrived.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new reading: `lambda_x1000` at `now_ms`.
    pub fn set(&self, lambda_x1000: u16, now_ms: u64) {
        *self.reading.lock().unwrap() = Some((lambda_x1000, now_ms));
    }

    /// The most recent reading and its age in ms as of `now_ms`, or
    /// `(None, u32::MAX)` if nothing has ever been published.
    pub fn read(&self, now_ms: u64) -> (Option<u16>, u32) {
        match *self.reading.lock().unwrap() {
            Some((value, at_ms)) => {
                let age = now_ms.saturating_sub(at_ms).min(u32::MAX as u64) as u32;
                (Some(value), age)
            }
            None => (None, u32::MAX),
        }
    }
}

/// PI gains; compiled-in defaults are `kp=0.6, ki=0.08, kd=0.01`.
#[derive(Debug, Clone, Copy)]
pub struct LambdaGains {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain.
    pub ki: f32,
    /// Derivative gain.
    pub kd: f32,
}

impl Default for LambdaGains {
    fn default() -> Self {
        Self {
            kp: 0.6,
            ki: 0.08,
            kd: 0.01,
        }
    }
}

/// Which lambda source `select_lambda` used, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaSource {
    /// External wideband reading, fresh enough to use directly.
    ExternalWideband,
    /// Derived from the narrowband O₂ voltage.
    NarrowbandDerived,
    /// Neither source usable this cycle.
    Invalid,
}

/// Select the measured lambda to feed the controller: prefer a fresh
/// external wideband reading, else derive a crude estimate from narrowband
/// mV, else report invalid.
pub fn select_lambda(
    external_lambda_x1000: Option<u16>,
    external_age_ms: u32,
    o2_mv: u16,
) -> (Option<f32>, LambdaSource) {
    if let Some(raw) = external_lambda_x1000 {
        if external_age_ms <= LAMBDA_EXTERNAL_MAX_AGE_MS {
            return (Some(raw as f32 / 1000.0), LambdaSource::ExternalWideband);
        }
    }
    if o2_mv > 0 {
        let lambda = (o2_mv as f32 / 1000.0) / NARROWBAND_LAMBDA_DIVISOR;
        let clamped = lambda.clamp(NARROWBAND_LAMBDA_MIN, NARROWBAND_LAMBDA_MAX);
        return (Some(clamped), LambdaSource::NarrowbandDerived);
    }
    (None, LambdaSource::Invalid)
}

/// PI controller state, plus the stability tracking needed to gate LTFT
/// integration and the accumulated long-term trim itself.
#[derive(Debug, Clone, Copy)]
pub struct LambdaController {
    gains: LambdaGains,
    integral: f32,
    prev_error: f32,
    /// Current short-term fuel trim, `[-STFT_LIMIT, STFT_LIMIT]`.
    stft: f32,
    /// Current long-term fuel trim, `[-LTFT_LIMIT, LTFT_LIMIT]`.
    ltft: f32,
    /// `(rpm, load)` at the start of the current stability window, if any.
    stable_since: Option<(u16, u16, u64)>,
    /// Closed loop enabled; when `false`, `trim()` returns 0 and does not
    /// advance the integrator.
    closed_loop_enabled: bool,
}

impl Default for LambdaController {
    fn default() -> Self {
        Self {
            gains: LambdaGains::default(),
            integral: 0.0,
            prev_error: 0.0,
            stft: 0.0,
            ltft: 0.0,
            stable_since: None,
            closed_loop_enabled: true,
        }
    }
}

impl LambdaController {
    /// Fresh controller with default gains, closed loop enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh controller using `gains` in place of the compiled-in defaults,
    /// e.g. loaded from `EcuConfig::lambda`.
    pub fn with_gains(gains: LambdaGains) -> Self {
        Self {
            gains,
            ..Self::default()
        }
    }

    /// Enable or disable closed-loop control globally. Disabling zeroes the
    /// returned trim immediately but leaves LTFT untouched.
    pub fn set_closed_loop_enabled(&mut self, enabled: bool) {
        self.closed_loop_enabled = enabled;
        if !enabled {
            self.stft = 0.0;
        }
    }

    /// Combined trim applied by `FuelMath`: `stft + ltft`, clamped to the
    /// tighter of the two limits so a pathological combination can't exceed
    /// `LAMBDA_FACTOR` headroom.
    pub fn trim(&self) -> f32 {
        if !self.closed_loop_enabled {
            return 0.0;
        }
        (self.stft + self.ltft).clamp(-STFT_LIMIT, STFT_LIMIT)
    }

    /// One PI update cycle: `err = target - measured`; integral advances by
    /// `err * dt_s` clamped so `ki * integral` stays within `±STFT_LIMIT`;
    /// `stft = clamp(kp*err + ki*integral + kd*(err-prev_err)/dt_s,
    /// ±STFT_LIMIT)`.
    pub fn update(&mut self, target: f32, measured: f32, dt_s: f32) -> f32 {
        if !self.closed_loop_enabled || dt_s <= 0.0 {
            self.stft = 0.0;
            return self.stft;
        }

        let err = target - measured;

        let i_limit = STFT_LIMIT / self.gains.ki.max(1e-6);
        self.integral = (self.integral + err * dt_s).clamp(-i_limit, i_limit);

        let derivative = (err - self.prev_error) / dt_s;
        self.prev_error = err;

        let raw = self.gains.kp * err + self.gains.ki * self.integral + self.gains.kd * derivative;
        self.stft = raw.clamp(-STFT_LIMIT, STFT_LIMIT);
        self.stft
    }

    /// Feed the current operating point and elapsed time to the stability
    /// tracker; once `rpm`/`load` have held within their deadbands for
    /// `LTFT_STABILITY_WINDOW_MS`, integrate `stft` into `ltft` at
    /// `LTFT_ALPHA` and reset the window. Returns `true` if the VE table
    /// should be written back this call (`|ltft| >= LTFT_APPLY_THRESHOLD`).
    pub fn integrate_ltft(&mut self, rpm: u16, load: u16, now_ms: u64) -> bool {
        if !self.closed_loop_enabled {
            return false;
        }

        let stable = match self.stable_since {
            Some((rpm0, load0, _)) => {
                rpm.abs_diff(rpm0) <= LTFT_STABLE_RPM_DELTA
                    && load.abs_diff(load0) <= LTFT_STABLE_LOAD_DELTA
            }
            None => false,
        };

        if !stable {
            self.stable_since = Some((rpm, load, now_ms));
            return false;
        }

        let (_, _, start_ms) = self.stable_since.unwrap();
        if now_ms.saturating_sub(start_ms) < LTFT_STABILITY_WINDOW_MS {
            return false;
        }

        self.ltft = (self.ltft + LTFT_ALPHA * self.stft).clamp(-LTFT_LIMIT, LTFT_LIMIT);
        self.stable_since = Some((rpm, load, now_ms));

        self.ltft.abs() >= LTFT_APPLY_THRESHOLD
    }

    /// Current LTFT value, for persistence and diagnostics.
    pub fn ltft(&self) -> f32 {
        self.ltft
    }

    /// Consume the pending write-back: returns the VE multiplier
    /// `1 + ltft * sign` to apply to the affected cell, then resets LTFT to
    /// zero.
    pub fn take_write_back_factor(&mut self) -> f32 {
        let factor = 1.0 + self.ltft;
        self.ltft = 0.0;
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_lambda_input_reports_age_and_staleness() {
        let input = ExternalLambdaInput::new();
        assert_eq!(input.read(1000), (None, u32::MAX));

        input.set(950, 1000);
        assert_eq!(input.read(1050), (Some(950), 50));

        let (value, age) = input.read(5000);
        assert_eq!(value, Some(950));
        assert!(age > LAMBDA_EXTERNAL_MAX_AGE_MS);
    }

    #[test]
    fn select_lambda_prefers_fresh_external() {
        let (lambda, source) = select_lambda(Some(950), 50, 0);
        assert_eq!(lambda, Some(0.95));
        assert_eq!(source, LambdaSource::ExternalWideband);
    }

    #[test]
    fn select_lambda_falls_back_to_narrowband_when_stale() {
        let (lambda, source) = select_lambda(Some(950), 500, 450);
        assert_eq!(source, LambdaSource::NarrowbandDerived);
        assert!((lambda.unwrap() - 1.0).abs() < 0.01);
    }

    #[test]
    fn select_lambda_invalid_with_no_source() {
        let (lambda, source) = select_lambda(None, 0, 0);
        assert_eq!(lambda, None);
        assert_eq!(source, LambdaSource::Invalid);
    }

    #[test]
    fn update_saturates_near_limit_on_sustained_error() {
        let mut ctl = LambdaController::new();
        let mut stft = 0.0;
        for _ in 0..200 {
            stft = ctl.update(1.00, 0.90, 0.01);
        }
        assert!(stft > 0.20 && stft <= STFT_LIMIT);
    }

    #[test]
    fn update_zero_error_converges_to_zero() {
        let mut ctl = LambdaController::new();
        let stft = ctl.update(1.00, 1.00, 0.01);
        assert_eq!(stft, 0.0);
    }

    #[test]
    fn disabled_closed_loop_returns_zero_trim() {
        let mut ctl = LambdaController::new();
        ctl.update(1.00, 0.90, 0.01);
        ctl.set_closed_loop_enabled(false);
        assert_eq!(ctl.trim(), 0.0);
    }

    #[test]
    fn ltft_does_not_integrate_before_stability_window_elapses() {
        let mut ctl = LambdaController::new();
        ctl.update(1.00, 0.90, 0.01);
        assert!(!ctl.integrate_ltft(3000, 50, 0));
        assert!(!ctl.integrate_ltft(3000, 50, 100));
        assert_eq!(ctl.ltft(), 0.0);
    }

    #[test]
    fn ltft_integrates_after_stable_window_and_flags_write_back() {
        let mut ctl = LambdaController::new();
        for _ in 0..50 {
            ctl.update(1.00, 0.70, 0.01);
        }
        ctl.integrate_ltft(3000, 50, 0);
        let triggered = ctl.integrate_ltft(3000, 50, 600);
        assert!(ctl.ltft() > 0.0);
        if triggered {
            let factor = ctl.take_write_back_factor();
            assert!(factor > 1.0);
            assert_eq!(ctl.ltft(), 0.0);
        }
    }

    #[test]
    fn ltft_resets_stability_window_on_operating_point_change() {
        let mut ctl = LambdaController::new();
        ctl.update(1.00, 0.90, 0.01);
        ctl.integrate_ltft(3000, 50, 0);
        ctl.integrate_ltft(4000, 80, 100);
        assert_eq!(ctl.ltft(), 0.0);
    }
}
