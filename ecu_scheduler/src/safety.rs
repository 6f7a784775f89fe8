//! `SafetyMonitor`: three independently latching/de-latching checks
//! (over-rev, overheat, battery range) whose logical OR drives limp mode.
//!
//! Follows `safety_monitor.c` in keeping one latch per fault rather than a
//! single combined flag: an over-revving engine with healthy coolant and
//! battery should not need every check to clear before any of them can
//! de-assert.

use ecu_common::consts::{
    SAFETY_CLEAR_HOLDOFF_MS, SAFETY_OVERHEAT_CLT_C, SAFETY_OVER_REV_CLEAR_RPM,
    SAFETY_OVER_REV_RPM, SAFETY_VBAT_MAX_DV, SAFETY_VBAT_MIN_DV,
};

/// One independently-latching fault check.
#[derive(Debug, Clone, Copy, Default)]
struct Latch {
    /// Currently tripped.
    tripped: bool,
    /// Milliseconds this check has read healthy, for the de-assert holdoff.
    healthy_for_ms: u64,
}

impl Latch {
    fn update(&mut self, unhealthy: bool, dt_ms: u64) {
        if unhealthy {
            self.tripped = true;
            self.healthy_for_ms = 0;
            return;
        }
        if !self.tripped {
            return;
        }
        self.healthy_for_ms += dt_ms;
        if self.healthy_for_ms >= SAFETY_CLEAR_HOLDOFF_MS {
            self.tripped = false;
            self.healthy_for_ms = 0;
        }
    }
}

/// Engine health monitor: over-rev, overheat, and battery-voltage limp-mode
/// latches. `limp_mode()` is the logical OR of all three.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyMonitor {
    over_rev: Latch,
    overheat: Latch,
    vbat: Latch,
}

impl SafetyMonitor {
    /// A fresh monitor, all latches clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one cycle's sensor readings against the three thresholds.
    /// `dt_ms` is the elapsed time since the previous call, used to drive
    /// the de-assert holdoff timers.
    pub fn update(&mut self, rpm: u16, clt_c: i16, vbat_dv: u16, dt_ms: u64) {
        let over_rev_unhealthy = if self.over_rev.tripped {
            rpm >= SAFETY_OVER_REV_CLEAR_RPM
        } else {
            rpm >= SAFETY_OVER_REV_RPM
        };
        self.over_rev.update(over_rev_unhealthy, dt_ms);

        self.overheat.update(clt_c > SAFETY_OVERHEAT_CLT_C, dt_ms);

        let vbat_out_of_range = !(SAFETY_VBAT_MIN_DV..=SAFETY_VBAT_MAX_DV).contains(&vbat_dv);
        self.vbat.update(vbat_out_of_range, dt_ms);
    }

    /// `true` iff any of the three checks is currently latched.
    pub fn limp_mode(&self) -> bool {
        self.over_rev.tripped || self.overheat.tripped || self.vbat.tripped
    }

    /// Individual latch queries, for diagnostics/telemetry.
    pub fn over_rev_tripped(&self) -> bool {
        self.over_rev.tripped
    }

    /// See [`Self::over_rev_tripped`].
    pub fn overheat_tripped(&self) -> bool {
        self.overheat.tripped
    }

    /// See [`Self::over_rev_tripped`].
    pub fn vbat_tripped(&self) -> bool {
        self.vbat.tripped
    }
}
