//! # ECU Scheduler
//!
//! Real-time fuel/spark scheduling core for a four-cylinder, four-stroke
//! engine control unit. Reconstructs crank/cam phase from a toothed wheel,
//! evaluates calibration tables and closed-loop lambda trim, and arms the
//! eight injector/coil outputs against a free-running hardware counter.
//!
//! ## Entry points
//!
//! [`controller::CoreController`] is the single owner of runtime state. Its
//! two real-time hooks are driven by the surrounding executable (or a test
//! harness): [`controller::CoreController::on_tooth_event`] on every
//! qualifying crank-wheel edge, and
//! [`controller::CoreController::on_cycle_tick`] on a ~1ms background
//! cadence for safety evaluation, lambda/LTFT control, and throttled
//! calibration persistence.
//!
//! ## Zero-allocation hot path
//!
//! [`phase`] and [`scheduler`] touch no heap: phase reconstruction is a
//! fixed ring buffer, and scheduling walks a fixed-size cylinder array. The
//! only heap allocation on the control path is calibration persistence,
//! which runs at most once every [`ecu_common::consts::PERSIST_THROTTLE_MS`].

#![deny(clippy::disallowed_types)]

pub mod config;
pub mod controller;
pub mod error;
pub mod fuel;
pub mod lambda;
pub mod phase;
pub mod safety;
pub mod scheduler;
pub mod table_engine;
pub mod timing;
