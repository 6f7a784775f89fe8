//! `CoreController`: orchestrates phase tracking, scheduling, closed-loop
//! lambda/LTFT, safety monitoring, the software watchdog, and throttled
//! calibration persistence behind the two real-time entry points
//! (`on_tooth_event`, `on_cycle_tick`).
//!
//! A single owner holds pre-allocated runtime state and is fed by two
//! distinct input events rather than one monolithic poll loop: read
//! (sensors/phase) → process (schedule/control) → write (arm outputs,
//! persist), one tooth event and one 1 ms cycle tick at a time.

use std::sync::Arc;

use ecu_common::config::ConfigLoader;
use ecu_common::consts::RPM_MAX_SAFE;
use ecu_common::persistence::{get_json, put_json, KvStore, PersistenceError};
use ecu_common::sensor::SensorSeqlock;
use ecu_common::table::Table16x16;

use crate::config::{ClosedLoopConfigRecord, EcuConfig, EoiConfigRecord};
use crate::error::CoreError;
use crate::lambda::{select_lambda, ExternalLambdaInput, LambdaController, LambdaGains};
use crate::phase::{PhaseTracker, SyncState, ToothEvent};
use crate::safety::SafetyMonitor;
use crate::scheduler::{Scheduler, SchedulerCounters};
use crate::table_engine::TableEngine;
use crate::timing::TimingOutput;

fn default_fuel_table() -> Table16x16 {
    Table16x16::filled(1000, 0, 8000, 0, 100)
}

fn default_ignition_table() -> Table16x16 {
    Table16x16::filled(150, 0, 8000, 0, 100)
}

fn default_lambda_table() -> Table16x16 {
    Table16x16::filled(1000, 0, 8000, 0, 100)
}

/// Load the table stored under `key`, falling back to `default` and logging
/// a warning if the record is missing, unreadable, or fails its checksum.
fn load_table(store: &dyn KvStore, key: &str, default: Table16x16) -> Table16x16 {
    match get_json::<Table16x16>(store, key) {
        Ok(table) if table.is_valid() => table,
        Ok(_) => {
            tracing::warn!(key, "persisted table failed checksum validation, using default");
            default
        }
        Err(PersistenceError::NotFound(_)) => default,
        Err(e) => {
            tracing::warn!(key, error = %e, "failed to load persisted table, using default");
            default
        }
    }
}

/// Load the end-of-injection calibration under `"eoi_config"`, falling back
/// to `default` (built from `EcuConfig`) if the record is missing,
/// unreadable, or fails its checksum.
fn load_eoi_config(store: &dyn KvStore, default: EoiConfigRecord) -> EoiConfigRecord {
    match get_json::<EoiConfigRecord>(store, "eoi_config") {
        Ok(record) if record.is_valid() => record,
        Ok(_) => {
            tracing::warn!("persisted eoi_config failed checksum validation, using default");
            default
        }
        Err(PersistenceError::NotFound(_)) => default,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load persisted eoi_config, using default");
            default
        }
    }
}

/// Load the closed-loop enablement flag under `"closed_loop_cfg"`, falling
/// back to `default` if the record is missing, unreadable, or fails its
/// checksum.
fn load_closed_loop_cfg(store: &dyn KvStore, default: ClosedLoopConfigRecord) -> ClosedLoopConfigRecord {
    match get_json::<ClosedLoopConfigRecord>(store, "closed_loop_cfg") {
        Ok(record) if record.is_valid() => record,
        Ok(_) => {
            tracing::warn!("persisted closed_loop_cfg failed checksum validation, using default");
            default
        }
        Err(PersistenceError::NotFound(_)) => default,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load persisted closed_loop_cfg, using default");
            default
        }
    }
}

/// Snapshot of controller health, cheap to poll from a diagnostics/telemetry task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerStatus {
    /// Any safety latch asserted, or the watchdog has starved.
    pub limp_mode: bool,
    /// Current phase synchronization state.
    pub sync_state: SyncState,
    /// Instantaneous RPM estimate, clamped to `RPM_MAX_SAFE`.
    pub rpm: u16,
    /// Scheduling targets dropped because they were already in the past.
    pub late: u64,
    /// Rearms refused due to the collision window.
    pub rearm_collision: u64,
}

/// Owns every subsystem and the housekeeping timers (watchdog feed,
/// persistence throttle) that tie them to wall-clock time.
pub struct CoreController {
    config: EcuConfig,
    store: Arc<dyn KvStore>,
    phase: PhaseTracker,
    scheduler: Scheduler,
    tables: TableEngine,
    lambda: LambdaController,
    safety: SafetyMonitor,
    sensors: SensorSeqlock,
    external_lambda: ExternalLambdaInput,
    eoi_config: EoiConfigRecord,
    closed_loop_cfg: ClosedLoopConfigRecord,
    last_cycle_ms: Option<u64>,
    last_persist_ms: u64,
    last_watchdog_feed_ms: u64,
    watchdog_starved: bool,
}

impl CoreController {
    /// Build a controller from a validated configuration and a persistence
    /// backend. Calibration tables are loaded from `store` (falling back to
    /// firmware defaults on a missing or corrupt record); the engine starts
    /// unsynced with the watchdog considered freshly fed at `t=0`.
    pub fn new(config: EcuConfig, store: Arc<dyn KvStore>) -> Result<Self, CoreError> {
        config.validate()?;

        let fuel = load_table(store.as_ref(), "fuel_map", default_fuel_table());
        let ignition = load_table(store.as_ref(), "ignition_map", default_ignition_table());
        let lambda_table = load_table(store.as_ref(), "lambda_map", default_lambda_table());
        let eoi_config = load_eoi_config(
            store.as_ref(),
            EoiConfigRecord::new(config.target_eoi_deg, config.target_eoi_fallback_deg),
        );
        let closed_loop_cfg = load_closed_loop_cfg(store.as_ref(), ClosedLoopConfigRecord::new(true));

        Ok(Self {
            phase: PhaseTracker::new(config.tooth_count_total),
            scheduler: Scheduler::new(config.cyl_tdc_deg, eoi_config.eoi_deg, eoi_config.eoi_fallback_deg),
            tables: TableEngine::new(fuel, ignition, lambda_table),
            lambda: LambdaController::with_gains(LambdaGains {
                kp: config.lambda.kp,
                ki: config.lambda.ki,
                kd: config.lambda.kd,
            }),
            safety: SafetyMonitor::new(),
            sensors: SensorSeqlock::new(),
            external_lambda: ExternalLambdaInput::new(),
            eoi_config,
            closed_loop_cfg,
            last_cycle_ms: None,
            last_persist_ms: 0,
            last_watchdog_feed_ms: 0,
            watchdog_starved: false,
            config,
            store,
        })
    }

    /// Load configuration from `path`, validate it, and build a controller
    /// backed by a file-based calibration store rooted at `config.store_path`.
    pub fn from_config_file(path: &std::path::Path) -> Result<Self, CoreError> {
        let config = EcuConfig::load(path)?;
        let store = ecu_common::persistence::FileKvStore::open(&config.store_path)?;
        Self::new(config, Arc::new(store))
    }

    /// Handle to the sensor seqlock: the designated single writer (the
    /// analog acquisition task) publishes readings here.
    pub fn sensors(&self) -> &SensorSeqlock {
        &self.sensors
    }

    /// Handle to the external wideband lambda input: whatever task polls
    /// that sensor (if fitted) publishes readings here. `on_cycle_tick`
    /// prefers a fresh reading over the narrowband O2 estimate every cycle.
    pub fn external_lambda(&self) -> &ExternalLambdaInput {
        &self.external_lambda
    }

    /// The validated configuration this controller was built from.
    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    /// Mark the watchdog fed at `now_ms`, clearing any starvation limp-mode
    /// condition. Called by whatever task is still making forward progress
    /// (typically the tooth-event ISR or its simulation-mode equivalent).
    pub fn feed_watchdog(&mut self, now_ms: u64) {
        self.last_watchdog_feed_ms = now_ms;
        self.watchdog_starved = false;
    }

    /// Current health snapshot.
    pub fn status(&self) -> ControllerStatus {
        let SchedulerCounters { late, rearm_collision } = self.scheduler.counters();
        ControllerStatus {
            limp_mode: self.safety.limp_mode() || self.watchdog_starved,
            sync_state: self.phase.state().sync_state,
            rpm: self.phase.rpm().min(RPM_MAX_SAFE as u32) as u16,
            late,
            rearm_collision,
        }
    }

    /// Real-time tooth-event entry point: advance phase reconstruction and
    /// run one scheduling pass. `now_ticks` is the free-running 1 MHz
    /// counter value at the instant this tooth was observed.
    pub fn on_tooth_event(
        &mut self,
        event: ToothEvent,
        now_ticks: u32,
        output: &mut impl TimingOutput,
    ) -> Result<(), CoreError> {
        self.phase.on_tooth(event);
        let phase_state = self.phase.state();
        let has_phase = self.phase.has_phase();
        let limp = self.safety.limp_mode() || self.watchdog_starved;
        let lambda_corr = if limp { 0.0 } else { self.lambda.trim() };

        self.scheduler.on_tooth(
            &phase_state,
            has_phase,
            &self.sensors,
            &mut self.tables,
            lambda_corr,
            limp,
            self.safety.over_rev_tripped(),
            0,
            now_ticks,
            output,
        )
    }

    /// Background 1 ms cycle tick: safety evaluation, closed-loop lambda
    /// update and LTFT integration, watchdog starvation check, and throttled
    /// calibration persistence.
    pub fn on_cycle_tick(&mut self, now_ms: u64) -> Result<(), CoreError> {
        let dt_ms = match self.last_cycle_ms {
            Some(prev) => now_ms.saturating_sub(prev),
            None => 0,
        };
        self.last_cycle_ms = Some(now_ms);

        if now_ms.saturating_sub(self.last_watchdog_feed_ms) > self.config.watchdog_timeout_ms {
            self.watchdog_starved = true;
        }

        let snapshot = self.sensors.read()?;
        let rpm = self.phase.rpm().min(RPM_MAX_SAFE as u32) as u16;
        self.safety.update(rpm, snapshot.clt_c, snapshot.vbat_dv, dt_ms);

        let limp = self.safety.limp_mode() || self.watchdog_starved;
        self.lambda
            .set_closed_loop_enabled(!limp && self.closed_loop_cfg.enabled);

        let load = (snapshot.map_kpa_x10 / 10).max(1);
        let target = self.tables.target_lambda(rpm, load).unwrap_or(1.0);
        let (ext_lambda_x1000, ext_age_ms) = self.external_lambda.read(now_ms);
        let (measured, _source) = select_lambda(ext_lambda_x1000, ext_age_ms, snapshot.o2_mv);
        if let Some(measured) = measured {
            self.lambda.update(target, measured, dt_ms as f32 / 1000.0);
            if self.lambda.integrate_ltft(rpm, load, now_ms) {
                let factor = self.lambda.take_write_back_factor();
                let current_ve = self.tables.ve_x10(rpm, load).unwrap_or(1000);
                let new_ve = (current_ve as f32 * factor).round().clamp(0.0, u16::MAX as f32) as u16;
                self.tables.apply_fuel_trim(rpm, load, new_ve);
            }
        }

        if now_ms.saturating_sub(self.last_persist_ms) >= self.config.persist_throttle_ms {
            self.persist_tables()?;
            self.last_persist_ms = now_ms;
        }

        Ok(())
    }

    /// Write the three calibration tables and the `eoi_config`/
    /// `closed_loop_cfg` records through the persistence backend.
    fn persist_tables(&self) -> Result<(), CoreError> {
        put_json(self.store.as_ref(), "fuel_map", self.tables.fuel_table())?;
        put_json(self.store.as_ref(), "ignition_map", self.tables.ignition_table())?;
        put_json(self.store.as_ref(), "lambda_map", self.tables.lambda_table())?;
        put_json(self.store.as_ref(), "eoi_config", &self.eoi_config)?;
        put_json(self.store.as_ref(), "closed_loop_cfg", &self.closed_loop_cfg)?;
        Ok(())
    }

    /// Overwrite the end-of-injection calibration, taking effect on the next
    /// scheduling pass and the next persistence cycle. Recomputes the
    /// record's checksum.
    pub fn set_eoi_config(&mut self, eoi_deg: f32, eoi_fallback_deg: f32) {
        self.eoi_config = EoiConfigRecord::new(eoi_deg, eoi_fallback_deg);
        self.scheduler.set_eoi_targets(eoi_deg, eoi_fallback_deg);
    }

    /// Overwrite the closed-loop lambda enablement flag, taking effect on
    /// the next cycle tick and the next persistence cycle.
    pub fn set_closed_loop_enabled(&mut self, enabled: bool) {
        self.closed_loop_cfg = ClosedLoopConfigRecord::new(enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::SimTimingOutput;
    use ecu_common::consts::WATCHDOG_TIMEOUT_MS;
    use ecu_common::persistence::MemKvStore;
    use ecu_common::sensor::SensorSnapshot;

    fn mem_store() -> Arc<dyn KvStore> {
        Arc::new(MemKvStore::default())
    }

    fn nominal_snapshot() -> SensorSnapshot {
        SensorSnapshot {
            map_kpa_x10: 1000,
            clt_c: 80,
            iat_c: 25,
            tps_percent_x10: 200,
            o2_mv: 450,
            vbat_dv: 138,
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut cfg = EcuConfig::default();
        cfg.tooth_count_total = 2;
        assert!(CoreController::new(cfg, mem_store()).is_err());
    }

    #[test]
    fn status_reports_unsynced_and_healthy_at_startup() {
        let controller = CoreController::new(EcuConfig::default(), mem_store()).unwrap();
        let status = controller.status();
        assert_eq!(status.sync_state, SyncState::Unsynced);
        assert!(!status.limp_mode);
        assert_eq!(status.rpm, 0);
    }

    #[test]
    fn watchdog_starvation_sets_limp_mode() {
        let mut controller = CoreController::new(EcuConfig::default(), mem_store()).unwrap();
        controller.sensors().write(nominal_snapshot());
        controller.on_cycle_tick(WATCHDOG_TIMEOUT_MS + 1).unwrap();
        assert!(controller.status().limp_mode);
    }

    #[test]
    fn feed_watchdog_clears_starvation() {
        let mut controller = CoreController::new(EcuConfig::default(), mem_store()).unwrap();
        controller.sensors().write(nominal_snapshot());
        controller.on_cycle_tick(WATCHDOG_TIMEOUT_MS + 1).unwrap();
        assert!(controller.status().limp_mode);

        controller.feed_watchdog(WATCHDOG_TIMEOUT_MS + 1);
        controller.on_cycle_tick(WATCHDOG_TIMEOUT_MS + 2).unwrap();
        assert!(!controller.status().limp_mode);
    }

    #[test]
    fn fast_tooth_stream_drives_rpm_past_over_rev_and_trips_limp() {
        let mut controller = CoreController::new(EcuConfig::default(), mem_store()).unwrap();
        controller.sensors().write(nominal_snapshot());
        controller.feed_watchdog(0);
        let mut output = SimTimingOutput::new();

        // 80us tooth period on the default 58-tooth (60 logical position)
        // wheel yields ~12500rpm, clamped to RPM_MAX_SAFE -- well past the
        // over-rev threshold.
        let mut ts = 0u32;
        for _ in 0..5u32 {
            controller
                .on_tooth_event(ToothEvent { timestamp_us: ts, is_cam_phase: false }, ts, &mut output)
                .unwrap();
            ts += 80;
        }

        controller.on_cycle_tick(10).unwrap();
        assert!(controller.status().limp_mode);
        assert!(controller.status().rpm > 7500);
    }

    #[test]
    fn persists_tables_once_throttle_interval_elapses() {
        let store = mem_store();
        let mut cfg = EcuConfig::default();
        cfg.persist_throttle_ms = 50;
        let mut controller = CoreController::new(cfg, store.clone()).unwrap();
        controller.sensors().write(nominal_snapshot());

        controller.on_cycle_tick(0).unwrap();
        assert!(store.get("fuel_map").unwrap().is_none());

        controller.on_cycle_tick(60).unwrap();
        assert!(store.get("fuel_map").unwrap().is_some());
    }

    #[test]
    fn external_lambda_reading_drives_closed_loop_trim_not_narrowband() {
        let store = mem_store();
        let mut cfg = EcuConfig::default();
        cfg.persist_throttle_ms = 0;
        let mut controller = CoreController::new(cfg, store.clone()).unwrap();
        // o2_mv = 0: narrowband fallback is unusable, so any trim observed
        // below can only have come from the external wideband reading.
        controller.sensors().write(SensorSnapshot {
            o2_mv: 0,
            ..nominal_snapshot()
        });

        let mut now_ms = 0u64;
        for _ in 0..80 {
            controller.external_lambda().set(800, now_ms); // lambda 0.800, lean of target 1.0
            controller.on_cycle_tick(now_ms).unwrap();
            now_ms += 100;
        }

        let persisted: Table16x16 = get_json(store.as_ref(), "fuel_map").unwrap();
        assert_ne!(
            persisted,
            default_fuel_table(),
            "LTFT write-back should have adjusted VE away from the default once \
             the external wideband reading drove the controller off target"
        );
    }

    #[test]
    fn loads_corrupted_table_as_default_and_logs() {
        let store = mem_store();
        store.put("fuel_map", b"not a valid framed record").unwrap();
        // Construction must not fail; it falls back to the default table.
        let controller = CoreController::new(EcuConfig::default(), store).unwrap();
        assert_eq!(controller.status().sync_state, SyncState::Unsynced);
    }
}
