//! `TableEngine`: owns the three calibration tables (VE/fuel, ignition
//! advance, lambda target) plus their independent deadband caches.
//!
//! Built on `ecu_common::table::{Table16x16, InterpCache}`; this module just
//! gives each table a name and a dedicated cache instance so the
//! scheduler's hot path (`on_tooth`) never has to thread three separate
//! `(Table16x16, InterpCache)` pairs by hand.

use ecu_common::consts::{SCALE_DEG_VE, SCALE_LAMBDA};
use ecu_common::table::{InterpCache, Table16x16};

/// The three live calibration tables and their per-table deadband caches.
pub struct TableEngine {
    fuel: Table16x16,
    fuel_cache: InterpCache,
    ignition: Table16x16,
    ignition_cache: InterpCache,
    lambda: Table16x16,
    lambda_cache: InterpCache,
}

impl TableEngine {
    /// Build from three already-loaded tables (persisted or freshly defaulted).
    pub fn new(fuel: Table16x16, ignition: Table16x16, lambda: Table16x16) -> Self {
        Self {
            fuel,
            fuel_cache: InterpCache::new(),
            ignition,
            ignition_cache: InterpCache::new(),
            lambda,
            lambda_cache: InterpCache::new(),
        }
    }

    /// Defaults matching `fuel_calc_init_defaults()`: VE=1000 (100%),
    /// ignition=150 (15.0°), lambda=1000 (λ=1.000), each spread over a
    /// representative 0–8000 rpm / 0–100 kPa grid.
    pub fn defaults() -> Self {
        Self::new(
            Table16x16::filled(1000, 0, 8000, 0, 100),
            Table16x16::filled(150, 0, 8000, 0, 100),
            Table16x16::filled(1000, 0, 8000, 0, 100),
        )
    }

    /// VE percent ×10 at `(rpm, load)`.
    pub fn ve_x10(&mut self, rpm: u16, load: u16) -> Option<u16> {
        self.fuel_cache.lookup(&self.fuel, rpm, load)
    }

    /// Ignition advance in degrees (`raw / SCALE_DEG_VE`) at `(rpm, load)`.
    pub fn ignition_advance_deg(&mut self, rpm: u16, load: u16) -> Option<f32> {
        self.ignition_cache
            .lookup(&self.ignition, rpm, load)
            .map(|raw| raw as f32 / SCALE_DEG_VE as f32)
    }

    /// Target lambda (`raw / SCALE_LAMBDA`) at `(rpm, load)`.
    pub fn target_lambda(&mut self, rpm: u16, load: u16) -> Option<f32> {
        self.lambda_cache
            .lookup(&self.lambda, rpm, load)
            .map(|raw| raw as f32 / SCALE_LAMBDA as f32)
    }

    /// Read-only access to the fuel (VE) table, e.g. for persistence.
    pub fn fuel_table(&self) -> &Table16x16 {
        &self.fuel
    }

    /// Read-only access to the ignition table.
    pub fn ignition_table(&self) -> &Table16x16 {
        &self.ignition
    }

    /// Read-only access to the lambda table.
    pub fn lambda_table(&self) -> &Table16x16 {
        &self.lambda
    }

    /// Write back a cell of the fuel table at the nearest bin to `(rpm,
    /// load)` and recompute its checksum. Used by the LTFT write-back path.
    pub fn apply_fuel_trim(&mut self, rpm: u16, load: u16, new_ve_x10: u16) {
        let ix = Self::nearest_bin(&self.fuel.rpm_bins, rpm);
        let iy = Self::nearest_bin(&self.fuel.load_bins, load);
        self.fuel.cells[ix][iy] = new_ve_x10;
        self.fuel.recompute_checksum();
    }

    fn nearest_bin(bins: &[u16; ecu_common::consts::TABLE_AXIS_LEN], value: u16) -> usize {
        let mut best = 0usize;
        let mut best_dist = u16::MAX;
        for (i, &b) in bins.iter().enumerate() {
            let dist = b.abs_diff(value);
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fuel_calc_init_defaults() {
        let mut engine = TableEngine::defaults();
        assert_eq!(engine.ve_x10(3000, 50), Some(1000));
        assert_eq!(engine.ignition_advance_deg(3000, 50), Some(15.0));
        assert_eq!(engine.target_lambda(3000, 50), Some(1.0));
    }

    #[test]
    fn apply_fuel_trim_updates_nearest_cell_and_checksum() {
        let mut engine = TableEngine::defaults();
        let before = engine.fuel_table().checksum;
        engine.apply_fuel_trim(3000, 50, 1050);
        assert_ne!(engine.fuel_table().checksum, before);
        assert!(engine.fuel_table().is_valid());
    }

    #[test]
    fn caches_are_independent_per_table() {
        let mut engine = TableEngine::defaults();
        engine.ve_x10(3000, 50);
        engine.apply_fuel_trim(3000, 50, 1100);
        // Fuel cache must miss (checksum changed) even though ignition/lambda
        // tables, and their caches, are untouched.
        assert_eq!(engine.ve_x10(3000, 50), Some(1100));
        assert_eq!(engine.ignition_advance_deg(3000, 50), Some(15.0));
    }
}
