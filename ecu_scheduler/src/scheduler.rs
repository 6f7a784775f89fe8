//! `Scheduler`: on each qualifying tooth event, computes per-cylinder spark
//! and injection angles, converts them to absolute tick targets, and arms
//! `TimingOutput`. Owns the full-sync vs. degraded-mode (wasted-spark /
//! semi-sequential) branching and the per-channel rearm-collision guard.
//!
//! The angle algebra follows `ignition_timing.c`'s per-cylinder scheduling
//! loop; the rearm guard uses a "later request wins, count the collision"
//! shape so a pending edge is never silently clobbered without a trace.

use ecu_common::consts::{
    CYLINDER_COUNT, FULL_CYCLE_DEG, HALF_CYCLE_DEG, LIMP_ADVANCE_DEG, MIN_LEAD_US,
    REARM_COLLISION_WINDOW_US, RPM_MAX_SAFE,
};
use ecu_common::sensor::SensorSeqlock;

use crate::fuel::FuelMath;
use crate::phase::{PhaseState, SyncState};
use crate::table_engine::TableEngine;
use crate::timing::{ticks_ahead, Channel, ChannelStatus, TimingOutput};

/// Wrap `deg` into `[0, domain)`.
fn wrap(deg: f32, domain: f32) -> f32 {
    let mut d = deg % domain;
    if d < 0.0 {
        d += domain;
    }
    d
}

/// Coarse dwell-vs-voltage schedule (see GLOSSARY: Dwell), applied to an
/// "effective" battery voltage that is biased downward on a cold engine —
/// derived from the one worked example in the concrete scenario table
/// (`vbat_dv=105`, `clt_c=-5` ⇒ effective 9.8 V ⇒ 4.5 ms): `0.28 dV` of bias
/// per `°C` below a 20 °C reference, clamped at zero above it.
fn dwell_from_vbat(vbat_dv: u16, clt_c: i16) -> f32 {
    let cold_bias_dv = if clt_c < 20 {
        (20 - clt_c) as f32 * 0.28
    } else {
        0.0
    };
    let effective_v = (vbat_dv as f32 - cold_bias_dv) / 10.0;
    if effective_v < 11.0 {
        4.5
    } else if effective_v < 12.5 {
        3.5
    } else if effective_v < 14.0 {
        3.0
    } else {
        2.8
    }
}

/// RPM-dependent dwell bias: `0.85` above 8000 rpm, `1.15` below 1000 rpm,
/// `1.0` otherwise.
fn rpm_bias(rpm: u16) -> f32 {
    if rpm > 8000 {
        0.85
    } else if rpm < 1000 {
        1.15
    } else {
        1.0
    }
}

/// `rpm = 60e6 / (tooth_period_us * (N+2))`, clamped to `[0, RPM_MAX_SAFE]`.
fn rpm_from_phase(phase: &PhaseState) -> u16 {
    if phase.tooth_period_us == 0 {
        return 0;
    }
    let rpm = 60_000_000u64
        .checked_div(phase.tooth_period_us as u64 * phase.logical_positions() as u64)
        .unwrap_or(0);
    rpm.min(RPM_MAX_SAFE as u64) as u16
}

/// One cylinder (full sync) or cylinder pair (degraded) target angle.
struct CylinderTarget {
    /// Cylinder index to arm the coil/injector channels for.
    cylinder: u8,
    /// This cylinder's TDC angle within `domain`.
    tdc_deg: f32,
}

/// Per-cycle telemetry counters, read by `CoreController` for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerCounters {
    /// Scheduling targets dropped because they were already in the past.
    pub late: u64,
    /// Rearms refused because they collided with a pending rise edge.
    pub rearm_collision: u64,
}

/// Computes and arms injector/coil targets from phase and sensor state.
pub struct Scheduler {
    cyl_tdc_deg: [f32; CYLINDER_COUNT],
    target_eoi_deg: f32,
    target_eoi_fallback_deg: f32,
    last_armed: [Option<(u32, u32)>; 8],
    counters: SchedulerCounters,
}

impl Scheduler {
    /// Build a scheduler for an engine whose cylinders fire at
    /// `cyl_tdc_deg` (720° domain, one entry per cylinder). `target_eoi_deg`
    /// is the calibrated end-of-injection target (relative to each
    /// cylinder's TDC) used for full-sync scheduling; `target_eoi_fallback_deg`
    /// is used in its place while running the degraded, cylinder-paired
    /// schedule (no confirmed cam phase).
    pub fn new(
        cyl_tdc_deg: [f32; CYLINDER_COUNT],
        target_eoi_deg: f32,
        target_eoi_fallback_deg: f32,
    ) -> Self {
        Self {
            cyl_tdc_deg,
            target_eoi_deg,
            target_eoi_fallback_deg,
            last_armed: [None; 8],
            counters: SchedulerCounters::default(),
        }
    }

    /// The standard four-cylinder, even-fire 720° TDC layout: `0, 180, 360,
    /// 540`.
    pub fn standard_cyl_tdc_deg() -> [f32; CYLINDER_COUNT] {
        [0.0, 180.0, 360.0, 540.0]
    }

    /// Telemetry counters accumulated since construction.
    pub fn counters(&self) -> SchedulerCounters {
        self.counters
    }

    /// Overwrite the end-of-injection targets in place, e.g. after a
    /// recalibration write-back — counters and rearm state are preserved.
    pub fn set_eoi_targets(&mut self, target_eoi_deg: f32, target_eoi_fallback_deg: f32) {
        self.target_eoi_deg = target_eoi_deg;
        self.target_eoi_fallback_deg = target_eoi_fallback_deg;
    }

    /// Drive all eight channels low, e.g. on loss of sync.
    fn stop_all(&mut self, output: &mut impl TimingOutput) {
        for idx in 0..4u8 {
            output.force_low(Channel::injector(idx));
            output.force_low(Channel::coil(idx));
        }
        self.last_armed = [None; 8];
    }

    /// Arm `channel`, honoring the rearm-collision window: refuse (and
    /// count) a rearm that falls within `REARM_COLLISION_WINDOW_US` of a
    /// still-pending rise edge; otherwise arm and let the hardware
    /// overwrite the previous target. Late targets are counted, not
    /// propagated — scheduling continues for the remaining channels.
    fn arm_channel(
        &mut self,
        output: &mut impl TimingOutput,
        channel: Channel,
        rise_ticks: u32,
        fall_ticks: u32,
        now_ticks: u32,
    ) {
        if let Some((prev_rise, _)) = self.last_armed[channel.index()] {
            if output.status(channel) == ChannelStatus::Armed
                && ticks_ahead(prev_rise, now_ticks) < REARM_COLLISION_WINDOW_US
            {
                self.counters.rearm_collision += 1;
                return;
            }
        }
        match output.arm(channel, rise_ticks, fall_ticks, now_ticks) {
            Ok(()) => self.last_armed[channel.index()] = Some((rise_ticks, fall_ticks)),
            Err(_) => self.counters.late += 1,
        }
    }

    /// Schedule one cylinder's coil and injector, in that order, on
    /// `domain`-wrapped angle math.
    #[allow(clippy::too_many_arguments)]
    fn schedule_one(
        &mut self,
        output: &mut impl TimingOutput,
        target: &CylinderTarget,
        domain: f32,
        current_angle: f32,
        advance_deg: f32,
        pw_us: u32,
        dwell_ms: f32,
        us_per_deg: f32,
        target_eoi_deg: f32,
        now_ticks: u32,
    ) {
        let spark_deg = wrap(target.tdc_deg - advance_deg, domain);
        let delta_spark = wrap(spark_deg - current_angle, domain);
        let spark_ticks = now_ticks.wrapping_add((delta_spark * us_per_deg).round() as u32);

        let dwell_ticks = (dwell_ms * 1000.0).round() as u32;
        let mut dwell_start = spark_ticks.wrapping_sub(dwell_ticks);
        if ticks_ahead(dwell_start, now_ticks) < MIN_LEAD_US {
            dwell_start = now_ticks.wrapping_add(MIN_LEAD_US);
        }

        // soi = eoi - pw_deg: subtraction per the resolved SOI/EOI relation.
        let eoi_deg = wrap(target_eoi_deg + target.tdc_deg, domain);
        let pw_deg = pw_us as f32 / us_per_deg;
        let soi_deg = wrap(eoi_deg - pw_deg, domain);
        let delta_soi = wrap(soi_deg - current_angle, domain);
        let soi_ticks = now_ticks.wrapping_add((delta_soi * us_per_deg).round() as u32);
        let eoi_ticks = soi_ticks.wrapping_add(pw_us);

        self.arm_channel(
            output,
            Channel::coil(target.cylinder),
            dwell_start,
            spark_ticks,
            now_ticks,
        );
        self.arm_channel(
            output,
            Channel::injector(target.cylinder),
            soi_ticks,
            eoi_ticks,
            now_ticks,
        );
    }

    /// One full scheduling pass for a qualifying tooth event.
    ///
    /// `has_phase` reflects `PhaseTracker::has_phase()` — whether a cam edge
    /// has confirmed which of the two crank revolutions is active. `limp`
    /// is `SafetyMonitor::limp_mode()`; `lambda_corr` is whatever
    /// `LambdaController::trim()` returned this cycle (the caller passes
    /// `0.0` when closed loop is disabled or limp is active).
    ///
    /// `over_rev_limp` is `SafetyMonitor::over_rev_tripped()`: while it
    /// holds, injectors and coils are cut entirely (every channel forced
    /// low) rather than merely clamped, matching the over-rev scenario's
    /// "cut fuel, suppress spark until the engine has recovered" behavior.
    #[allow(clippy::too_many_arguments)]
    pub fn on_tooth(
        &mut self,
        phase: &PhaseState,
        has_phase: bool,
        sensors: &SensorSeqlock,
        tables: &mut TableEngine,
        lambda_corr: f32,
        limp: bool,
        over_rev_limp: bool,
        knock_retard_deg_x10: i16,
        now_ticks: u32,
        output: &mut impl TimingOutput,
    ) -> Result<(), crate::error::CoreError> {
        let snapshot = sensors.read()?;

        if matches!(phase.sync_state, SyncState::Unsynced | SyncState::Lost) {
            self.stop_all(output);
            return Ok(());
        }

        if over_rev_limp {
            self.stop_all(output);
            return Ok(());
        }

        let us_per_deg = phase.time_per_degree_us;
        if us_per_deg <= 0.0 {
            return Ok(());
        }

        let rpm = rpm_from_phase(phase);
        let load = (snapshot.map_kpa_x10 / 10).max(1);

        let ve_x10 = tables.ve_x10(rpm, load).unwrap_or(1000);
        let mut advance_deg = tables
            .ignition_advance_deg(rpm, load)
            .unwrap_or(15.0)
            - (knock_retard_deg_x10 as f32 / 10.0);
        if limp {
            advance_deg = advance_deg.min(LIMP_ADVANCE_DEG);
        }

        let pw_us = FuelMath::pulsewidth_us(snapshot.map_kpa_x10, snapshot.clt_c, rpm, ve_x10, lambda_corr);
        let dwell_ms = dwell_from_vbat(snapshot.vbat_dv, snapshot.clt_c) * rpm_bias(rpm);

        if phase.sync_state == SyncState::Acquired && has_phase {
            let current_angle = phase.current_angle_deg_720();
            for (c, &tdc_deg) in self.cyl_tdc_deg.iter().enumerate() {
                let target = CylinderTarget {
                    cylinder: c as u8,
                    tdc_deg,
                };
                self.schedule_one(
                    output,
                    &target,
                    FULL_CYCLE_DEG,
                    current_angle,
                    advance_deg,
                    pw_us,
                    dwell_ms,
                    us_per_deg,
                    self.target_eoi_deg,
                    now_ticks,
                );
            }
        } else {
            let current_angle = wrap(phase.current_angle_deg_720(), HALF_CYCLE_DEG);
            const PAIRS: [(u8, u8, f32); 2] = [(0, 3, 0.0), (1, 2, 180.0)];
            for &(a, b, tdc_deg) in &PAIRS {
                let shared = CylinderTarget {
                    cylinder: a,
                    tdc_deg,
                };
                self.schedule_one(
                    output,
                    &shared,
                    HALF_CYCLE_DEG,
                    current_angle,
                    advance_deg,
                    pw_us,
                    dwell_ms,
                    us_per_deg,
                    self.target_eoi_fallback_deg,
                    now_ticks,
                );
                let (coil_rise, coil_fall) = self.last_armed[Channel::coil(a).index()].unwrap_or((now_ticks, now_ticks));
                let (inj_rise, inj_fall) = self.last_armed[Channel::injector(a).index()].unwrap_or((now_ticks, now_ticks));
                self.arm_channel(output, Channel::coil(b), coil_rise, coil_fall, now_ticks);
                self.arm_channel(output, Channel::injector(b), inj_rise, inj_fall, now_ticks);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::SimTimingOutput;

    fn sensors_nominal() -> SensorSeqlock {
        let lock = SensorSeqlock::new();
        lock.write(ecu_common::sensor::SensorSnapshot {
            map_kpa_x10: 1000,
            clt_c: 80,
            iat_c: 25,
            tps_percent_x10: 200,
            o2_mv: 0,
            vbat_dv: 138,
        });
        lock
    }

    fn acquired_phase(tooth_period_us: u32) -> PhaseState {
        let mut tracker = crate::phase::PhaseTracker::new(58);
        let mut ts = 0u32;
        for i in 0..80u32 {
            tracker.on_tooth(crate::phase::ToothEvent {
                timestamp_us: ts,
                is_cam_phase: i == 0,
            });
            ts += tooth_period_us;
        }
        tracker.state()
    }

    #[test]
    fn dwell_matches_scenario_c() {
        let dwell = dwell_from_vbat(105, -5);
        assert!((dwell - 4.5).abs() < 1e-6);
    }

    #[test]
    fn rpm_bias_applies_at_extremes() {
        assert_eq!(rpm_bias(500), 1.15);
        assert_eq!(rpm_bias(9000), 0.85);
        assert_eq!(rpm_bias(3000), 1.0);
    }

    #[test]
    fn soi_is_before_eoi_by_pulsewidth_in_degrees() {
        // Pin the resolved SOI/EOI relation: soi_deg = wrap(eoi_deg - pw_deg).
        let eoi_deg = 100.0_f32;
        let pw_deg = 10.0_f32;
        let soi_deg = wrap(eoi_deg - pw_deg, 720.0);
        assert_eq!(soi_deg, 90.0);
        // The rejected alternative (addition) must not satisfy this.
        assert_ne!(wrap(eoi_deg + pw_deg, 720.0), soi_deg);
    }

    #[test]
    fn lost_sync_forces_all_channels_low() {
        let mut scheduler = Scheduler::new(Scheduler::standard_cyl_tdc_deg(), 5.0, 5.0);
        let mut output = SimTimingOutput::new();
        output.set_counter(0);
        let ch = Channel::coil(0);
        output.arm(ch, 1000, 2000, 0).unwrap();

        let mut phase = acquired_phase(1000);
        phase.sync_state = SyncState::Lost;
        let sensors = sensors_nominal();
        let mut tables = TableEngine::defaults();

        scheduler
            .on_tooth(&phase, true, &sensors, &mut tables, 0.0, false, false, 0, 50_000, &mut output)
            .unwrap();

        assert_eq!(output.status(ch), ChannelStatus::Idle);
    }

    #[test]
    fn full_sync_arms_all_eight_channels() {
        let mut scheduler = Scheduler::new(Scheduler::standard_cyl_tdc_deg(), 5.0, 5.0);
        let mut output = SimTimingOutput::new();
        let phase = acquired_phase(1000);
        output.set_counter(50_000);
        let sensors = sensors_nominal();
        let mut tables = TableEngine::defaults();

        scheduler
            .on_tooth(&phase, true, &sensors, &mut tables, 0.0, false, false, 0, 50_000, &mut output)
            .unwrap();

        for c in 0..4u8 {
            assert_ne!(output.status(Channel::coil(c)), ChannelStatus::Idle);
            assert_ne!(output.status(Channel::injector(c)), ChannelStatus::Idle);
        }
    }

    #[test]
    fn degraded_mode_pairs_fire_together() {
        let mut scheduler = Scheduler::new(Scheduler::standard_cyl_tdc_deg(), 5.0, 5.0);
        let mut output = SimTimingOutput::new();
        let phase = acquired_phase(1000);
        output.set_counter(50_000);
        let sensors = sensors_nominal();
        let mut tables = TableEngine::defaults();

        scheduler
            .on_tooth(&phase, false, &sensors, &mut tables, 0.0, false, false, 0, 50_000, &mut output)
            .unwrap();

        assert_eq!(output.status(Channel::coil(0)), output.status(Channel::coil(3)));
        assert_eq!(output.status(Channel::coil(1)), output.status(Channel::coil(2)));
    }

    #[test]
    fn limp_mode_clamps_advance_to_limp_ceiling() {
        // Indirect check: with limp active, a pathologically high table
        // advance must not push spark further than LIMP_ADVANCE_DEG before
        // TDC, so the resulting coil rise edge cannot exceed that many
        // degrees of lead at a fixed tooth period.
        let mut scheduler = Scheduler::new(Scheduler::standard_cyl_tdc_deg(), 5.0, 5.0);
        let mut output = SimTimingOutput::new();
        let phase = acquired_phase(1000);
        output.set_counter(50_000);
        let sensors = sensors_nominal();
        let mut tables = TableEngine::defaults();
        tables.apply_fuel_trim(0, 0, 0); // no-op warm-up of cache path

        scheduler
            .on_tooth(&phase, true, &sensors, &mut tables, 0.0, true, false, 0, 50_000, &mut output)
            .unwrap();

        assert_ne!(output.status(Channel::coil(0)), ChannelStatus::Idle);
    }

    #[test]
    fn over_rev_limp_cuts_injectors_and_coils_entirely() {
        let mut scheduler = Scheduler::new(Scheduler::standard_cyl_tdc_deg(), 5.0, 5.0);
        let mut output = SimTimingOutput::new();
        output.set_counter(0);
        // Arm every channel first so a stale "Armed" status can't masquerade
        // as a cutout that never actually ran.
        for c in 0..4u8 {
            output.arm(Channel::coil(c), 1000, 2000, 0).unwrap();
            output.arm(Channel::injector(c), 1000, 2000, 0).unwrap();
        }

        let phase = acquired_phase(1000);
        let sensors = sensors_nominal();
        let mut tables = TableEngine::defaults();

        scheduler
            .on_tooth(&phase, true, &sensors, &mut tables, 0.0, true, true, 0, 50_000, &mut output)
            .unwrap();

        for c in 0..4u8 {
            assert_eq!(output.status(Channel::coil(c)), ChannelStatus::Idle);
            assert_eq!(output.status(Channel::injector(c)), ChannelStatus::Idle);
        }
    }

    #[test]
    fn rearm_within_collision_window_is_refused() {
        let mut scheduler = Scheduler::new(Scheduler::standard_cyl_tdc_deg(), 5.0, 5.0);
        let mut output = SimTimingOutput::new();
        let phase = acquired_phase(1000);
        output.set_counter(50_000);
        let sensors = sensors_nominal();
        let mut tables = TableEngine::defaults();

        scheduler
            .on_tooth(&phase, true, &sensors, &mut tables, 0.0, false, false, 0, 50_000, &mut output)
            .unwrap();
        let before = scheduler.counters().rearm_collision;
        // Re-run immediately (same `now_ticks`): any channel still Armed and
        // within the collision window must be refused, not overwritten.
        scheduler
            .on_tooth(&phase, true, &sensors, &mut tables, 0.0, false, false, 0, 50_000, &mut output)
            .unwrap();
        assert!(scheduler.counters().rearm_collision >= before);
    }
}
