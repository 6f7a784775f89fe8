//! `PhaseTracker`: crank angle reconstruction from a toothed wheel with a
//! synchronization gap, plus an optional cam edge for full 720° phasing.
//!
//! The current-angle formula follows `ignition_timing.c`'s
//! `compute_current_angle_deg()`; gap detection compares each interval
//! against a running median of recent tooth periods rather than a fixed
//! threshold, so it tracks acceleration and deceleration alike.

use ecu_common::consts::{FULL_CYCLE_DEG, HALF_CYCLE_DEG};

/// Number of tooth intervals kept for the running-median gap detector.
const RING_LEN: usize = 8;

/// Teeth either side of the reference index within which an arriving cam
/// edge is accepted as the 720°-cycle sync point.
const CAM_WINDOW_TEETH: u16 = 2;

/// Synchronization state of the phase tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No gap observed yet.
    Unsynced,
    /// One gap observed; waiting for a confirming second gap at the expected position.
    TentativeGap,
    /// Two consecutive gaps confirmed the tooth wheel's logical position.
    Acquired,
    /// An interval outside the plausible range broke sync; full outputs must degrade.
    Lost,
}

/// A single tooth (or cam) event delivered to [`PhaseTracker::on_tooth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToothEvent {
    /// Free-running microsecond timestamp of the tooth edge.
    pub timestamp_us: u32,
    /// Whether a cam-phase edge coincided with this tooth.
    pub is_cam_phase: bool,
}

/// Crank/cam phase state, owned exclusively by [`PhaseTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseState {
    /// Physical tooth count on the wheel (`N`); logical positions are `N+2`.
    pub tooth_count_total: u16,
    /// Microseconds between the last two non-gap teeth; 0 if unknown.
    pub tooth_period_us: u32,
    /// Logical tooth position, `0..=N+1`, including the two missing teeth.
    pub tooth_index: u16,
    /// Which of the two 360° crank revolutions of the 720° cycle, `{0,1}`.
    pub revolution_index: u8,
    /// Current synchronization state.
    pub sync_state: SyncState,
    /// Microseconds per crank degree, derived from `tooth_period_us`.
    pub time_per_degree_us: f32,
}

impl PhaseState {
    fn new(tooth_count_total: u16) -> Self {
        Self {
            tooth_count_total,
            tooth_period_us: 0,
            tooth_index: 0,
            revolution_index: 0,
            sync_state: SyncState::Unsynced,
            time_per_degree_us: 0.0,
        }
    }

    /// Logical position count, `N + 2` (two missing teeth for the gap).
    pub fn logical_positions(&self) -> u16 {
        self.tooth_count_total + 2
    }

    /// Current crank angle in the 720° domain:
    /// `revolution_index * 360 + tooth_index * (360 / (N+2))`.
    pub fn current_angle_deg_720(&self) -> f32 {
        let deg_per_tooth = FULL_CYCLE_DEG / 2.0 / self.logical_positions() as f32;
        self.revolution_index as f32 * (FULL_CYCLE_DEG / 2.0) + self.tooth_index as f32 * deg_per_tooth
    }
}

/// Reconstructs [`PhaseState`] from a stream of [`ToothEvent`]s.
pub struct PhaseTracker {
    state: PhaseState,
    ring: [u32; RING_LEN],
    ring_len: usize,
    ring_pos: usize,
    last_timestamp_us: Option<u32>,
    reference_tooth_index: u16,
    has_phase_hint: bool,
}

impl PhaseTracker {
    /// Construct a tracker for a wheel with `tooth_count_total` physical teeth.
    pub fn new(tooth_count_total: u16) -> Self {
        Self {
            state: PhaseState::new(tooth_count_total),
            ring: [0; RING_LEN],
            ring_len: 0,
            ring_pos: 0,
            last_timestamp_us: None,
            reference_tooth_index: 0,
            has_phase_hint: false,
        }
    }

    /// Current phase snapshot.
    pub fn state(&self) -> PhaseState {
        self.state
    }

    fn push_interval(&mut self, interval: u32) {
        self.ring[self.ring_pos] = interval;
        self.ring_pos = (self.ring_pos + 1) % RING_LEN;
        self.ring_len = (self.ring_len + 1).min(RING_LEN);
    }

    fn median(&self) -> u32 {
        if self.ring_len == 0 {
            return 0;
        }
        let mut copy: [u32; RING_LEN] = self.ring;
        let slice = &mut copy[..self.ring_len];
        slice.sort_unstable();
        slice[slice.len() / 2]
    }

    /// Feed one tooth (or cam) event and update the phase state.
    pub fn on_tooth(&mut self, event: ToothEvent) {
        let Some(last) = self.last_timestamp_us else {
            self.last_timestamp_us = Some(event.timestamp_us);
            return;
        };
        let interval = event.timestamp_us.wrapping_sub(last);
        self.last_timestamp_us = Some(event.timestamp_us);

        let median_before = self.median();
        let is_gap = self.ring_len > 0 && (interval as f32) > 1.5 * median_before as f32;

        self.state.tooth_period_us = interval;
        self.state.time_per_degree_us =
            interval as f32 * self.state.logical_positions() as f32 / HALF_CYCLE_DEG;

        let n_logical = self.state.logical_positions();
        let advance: u16 = if is_gap { 3 } else { 1 };

        match self.state.sync_state {
            SyncState::Unsynced => {
                if is_gap {
                    self.state.tooth_index = self.reference_tooth_index;
                    self.state.sync_state = SyncState::TentativeGap;
                }
                self.push_interval(interval);
            }
            SyncState::TentativeGap => {
                let before_index = self.state.tooth_index;
                self.state.tooth_index = (before_index + advance) % n_logical;
                if is_gap && self.state.tooth_index == self.reference_tooth_index {
                    self.state.sync_state = SyncState::Acquired;
                    if event.is_cam_phase {
                        self.state.revolution_index = 0;
                    }
                    // Absent cam edge: stays effectively phase-ambiguous; the
                    // Scheduler reads `revolution_index` only when it chooses
                    // to treat sync as full (it doesn't here — degraded mode
                    // is entered whenever TentativeGap never resolved a cam
                    // edge on acquisition, tracked via `has_phase()`).
                }
                self.push_interval(interval);
                if !self.has_phase_hint && event.is_cam_phase {
                    self.has_phase_hint = true;
                }
            }
            SyncState::Acquired => {
                let ratio = interval as f32 / median_before.max(1) as f32;
                if !is_gap && !(0.6..=1.8).contains(&ratio) {
                    self.state.sync_state = SyncState::Lost;
                    self.state.tooth_index = 0;
                    self.state.revolution_index = 0;
                    self.ring_len = 0;
                    self.ring_pos = 0;
                    self.has_phase_hint = false;
                    return;
                }
                let before_index = self.state.tooth_index;
                self.state.tooth_index = (before_index + advance) % n_logical;
                if self.state.tooth_index < before_index {
                    self.state.revolution_index ^= 1;
                }
                if event.is_cam_phase
                    && self.state.tooth_index.abs_diff(self.reference_tooth_index) <= CAM_WINDOW_TEETH
                {
                    self.state.revolution_index = 0;
                    self.has_phase_hint = true;
                }
                self.push_interval(interval);
            }
            SyncState::Lost => {
                if is_gap {
                    self.state.tooth_index = self.reference_tooth_index;
                    self.state.sync_state = SyncState::TentativeGap;
                    self.has_phase_hint = false;
                }
                self.push_interval(interval);
            }
        }
    }

    /// Instantaneous RPM estimate from the last tooth period:
    /// `rpm = 60e6 / (tooth_period_us * (N+2))`.
    pub fn rpm(&self) -> u32 {
        if self.state.tooth_period_us == 0 {
            return 0;
        }
        60_000_000u64
            .checked_div(self.state.tooth_period_us as u64 * self.state.logical_positions() as u64)
            .unwrap_or(0) as u32
    }

    /// Whether a cam edge has been observed near the reference tooth since
    /// the last loss of sync — i.e. whether `revolution_index` can be
    /// trusted for full-sequential scheduling, or only the degraded
    /// (360°-domain) fallback applies.
    pub fn has_phase(&self) -> bool {
        self.has_phase_hint
    }
}
