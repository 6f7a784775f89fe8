//! `SensorSnapshot`: the seqlock-protected analog/status readout shared between
//! the (external) sensor acquisition task and the core scheduler.
//!
//! The protocol is a classic seqlock: odd means a writer is mid-update, even
//! means the snapshot is stable. A reader retries while the counter is odd
//! or changes across the read.

use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of retries before a read is abandoned as [`ReadError::Stale`].
pub const SEQLOCK_MAX_RETRIES: u32 = 8;

/// Raw sensor fields, valid all-at-once at the instant a successful read completes.
///
/// All fields use the fixed-point encodings documented on each field; see
/// `consts::SCALE_*` for the shared scale factors used elsewhere in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SensorSnapshot {
    /// Manifold absolute pressure, kPa × 10.
    pub map_kpa_x10: u16,
    /// Coolant temperature, °C.
    pub clt_c: i16,
    /// Intake air temperature, °C.
    pub iat_c: i16,
    /// Throttle position, percent × 10.
    pub tps_percent_x10: u16,
    /// Narrowband O2 sensor reading, mV (0 if sensor absent).
    pub o2_mv: u16,
    /// Battery voltage, V × 10.
    pub vbat_dv: u16,
}

/// Error returned when a seqlock read does not settle within [`SEQLOCK_MAX_RETRIES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sensor snapshot seqlock did not settle after {0} retries")]
pub struct StaleSensorError(pub u32);

/// Single-writer, wait-free-reader seqlock wrapping a [`SensorSnapshot`].
///
/// A classic seqlock: the writer increments the counter to an odd value,
/// mutates the payload, then increments again to make it even. A reader
/// copies the payload, then checks the counter did not change and is
/// even; otherwise it retries.
pub struct SensorSeqlock {
    seq: AtomicU32,
    snapshot: std::cell::UnsafeCell<SensorSnapshot>,
}

// SAFETY: all mutation of `snapshot` happens through `write()`, which is the
// only place a `&mut` reference is formed, and the seqlock protocol ensures
// readers never observe a torn write (they detect it via the odd/changed
// sequence counter and retry). The writer is assumed single-threaded per the
// ownership rule in the data model (single writer).
unsafe impl Sync for SensorSeqlock {}

impl SensorSeqlock {
    /// Construct a seqlock initialized to the all-zero snapshot, sequence 0 (stable).
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            snapshot: std::cell::UnsafeCell::new(SensorSnapshot::default()),
        }
    }

    /// Publish a new snapshot. Must only be called by the single designated writer.
    pub fn write(&self, snapshot: SensorSnapshot) {
        let start = self.seq.load(Ordering::Relaxed);
        self.seq.store(start.wrapping_add(1), Ordering::Release);
        // SAFETY: we are the sole writer; the odd sequence value published above
        // signals any concurrent reader to retry rather than trust this write.
        unsafe {
            *self.snapshot.get() = snapshot;
        }
        self.seq
            .store(start.wrapping_add(2), Ordering::Release);
    }

    /// Read the current snapshot, retrying up to [`SEQLOCK_MAX_RETRIES`] times.
    ///
    /// Returns [`StaleSensorError`] if the counter never settles — the
    /// Scheduler treats this identically to `ERROR TAXONOMY::StaleSensor`
    /// in the core spec: skip the cycle, count it, continue.
    pub fn read(&self) -> Result<SensorSnapshot, StaleSensorError> {
        for _ in 0..SEQLOCK_MAX_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before % 2 != 0 {
                continue;
            }
            // SAFETY: reading a snapshot of plain-old-data fields; torn reads
            // are caught below by re-checking the sequence counter.
            let snapshot = unsafe { *self.snapshot.get() };
            let after = self.seq.load(Ordering::Acquire);
            if before == after {
                return Ok(snapshot);
            }
        }
        Err(StaleSensorError(SEQLOCK_MAX_RETRIES))
    }
}

impl Default for SensorSeqlock {
    fn default() -> Self {
        Self::new()
    }
}
