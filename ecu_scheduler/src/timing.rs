//! `TimingOutput`: absolute-compare arming against a free-running 1 MHz counter.
//!
//! Follows the high-precision MCPWM ignition driver shape (`mcpwm_ignition_hp.c`):
//! one hardware timer per channel runs continuously at 1 MHz and is never
//! restarted; scheduling an edge means rewriting that channel's compare
//! registers, nothing else. A restart-per-event timer variant is not
//! implemented here; see `DESIGN.md` for that decision.

use ecu_common::consts::{COUNTER_WRAP_US, HALF_WRAP, MIN_LEAD_US};

/// Which physical output a channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Fuel injector output.
    Injector,
    /// Ignition coil output.
    Coil,
}

/// One of the eight hardware channels (4 injectors + 4 coils).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Injector or coil.
    pub kind: ChannelKind,
    /// Cylinder index, `0..=3`.
    pub cylinder: u8,
}

impl Channel {
    /// Construct an injector channel for `cylinder`.
    pub const fn injector(cylinder: u8) -> Self {
        Self {
            kind: ChannelKind::Injector,
            cylinder,
        }
    }

    /// Construct a coil channel for `cylinder`.
    pub const fn coil(cylinder: u8) -> Self {
        Self {
            kind: ChannelKind::Coil,
            cylinder,
        }
    }

    /// Flat index into an 8-element channel array: injectors 0..3, coils 4..7.
    pub const fn index(&self) -> usize {
        let base = match self.kind {
            ChannelKind::Injector => 0,
            ChannelKind::Coil => 4,
        };
        base + self.cylinder as usize
    }
}

/// Coarse status of a channel, as queried by [`TimingOutput::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Forced low, no pending edge.
    Idle,
    /// A rise/fall pair is programmed but the rise edge has not yet occurred.
    Armed,
    /// The rise edge has occurred; output is currently driven high.
    Active,
}

/// `rise_ticks` was at or before `current_ticks + MIN_LEAD_US`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("arm target {rise_ticks} is not at least {min_lead_us}us ahead of counter {current_ticks}")]
pub struct LateError {
    /// The rejected rise-edge target.
    pub rise_ticks: u32,
    /// The counter value observed at arm time.
    pub current_ticks: u32,
    /// The configured minimum lead, for diagnostics.
    pub min_lead_us: u32,
}

/// Wrap-aware "ticks elapsed going from `b` to `a`", i.e. `(a - b) mod 2^32`.
pub const fn ticks_ahead(a: u32, b: u32) -> u32 {
    a.wrapping_sub(b)
}

/// `true` iff `rise` lies in the future relative to `now`, under the 2^31
/// half-wrap convention: at most half the counter space counts as "ahead".
pub const fn is_future(rise: u32, now: u32) -> bool {
    ticks_ahead(rise, now) < HALF_WRAP
}

/// Hardware abstraction for arming absolute-compare edges on the eight
/// injector/coil channels against one free-running, continuously-running
/// 1 MHz counter with a 30 s wrap period ([`COUNTER_WRAP_US`]).
pub trait TimingOutput {
    /// Program `channel`'s two compare registers so the output rises at
    /// `rise_ticks` and falls at `fall_ticks`, both in the same modular
    /// tick space as `current_ticks`. Fails with [`LateError`] if
    /// `rise_ticks <= current_ticks + MIN_LEAD_US`.
    fn arm(
        &mut self,
        channel: Channel,
        rise_ticks: u32,
        fall_ticks: u32,
        current_ticks: u32,
    ) -> Result<(), LateError>;

    /// Synchronously drive `channel` low and cancel any pending arm.
    fn force_low(&mut self, channel: Channel);

    /// The free-running tick count, modulo 2^32.
    fn read_counter(&self) -> u32;

    /// Coarse status of `channel`.
    fn status(&self, channel: Channel) -> ChannelStatus;
}

#[derive(Debug, Clone, Copy)]
struct SimChannelState {
    rise_ticks: u32,
    fall_ticks: u32,
    armed: bool,
}

impl Default for SimChannelState {
    fn default() -> Self {
        Self {
            rise_ticks: 0,
            fall_ticks: 0,
            armed: false,
        }
    }
}

/// Software simulation of [`TimingOutput`] for tests and non-RT operation:
/// a free-running counter driven explicitly by [`SimTimingOutput::advance`]
/// (rather than by a real 1 MHz hardware clock), plus the eight channels'
/// compare state.
pub struct SimTimingOutput {
    counter: u32,
    channels: [SimChannelState; 8],
}

impl SimTimingOutput {
    /// A fresh simulated timer, counter at 0, all channels idle/force-low.
    pub fn new() -> Self {
        Self {
            counter: 0,
            channels: [SimChannelState::default(); 8],
        }
    }

    /// Advance the free-running counter by `delta_us`, wrapping at 2^32 (and
    /// conceptually at [`COUNTER_WRAP_US`] on real hardware).
    pub fn advance(&mut self, delta_us: u32) {
        self.counter = self.counter.wrapping_add(delta_us);
    }

    /// Directly set the counter (for deterministic test setup).
    pub fn set_counter(&mut self, ticks: u32) {
        self.counter = ticks;
    }
}

impl Default for SimTimingOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingOutput for SimTimingOutput {
    fn arm(
        &mut self,
        channel: Channel,
        rise_ticks: u32,
        fall_ticks: u32,
        current_ticks: u32,
    ) -> Result<(), LateError> {
        if ticks_ahead(rise_ticks, current_ticks) < MIN_LEAD_US || !is_future(rise_ticks, current_ticks) {
            return Err(LateError {
                rise_ticks,
                current_ticks,
                min_lead_us: MIN_LEAD_US,
            });
        }
        let state = &mut self.channels[channel.index()];
        state.rise_ticks = rise_ticks;
        state.fall_ticks = fall_ticks;
        state.armed = true;
        Ok(())
    }

    fn force_low(&mut self, channel: Channel) {
        let state = &mut self.channels[channel.index()];
        state.armed = false;
    }

    fn read_counter(&self) -> u32 {
        self.counter
    }

    fn status(&self, channel: Channel) -> ChannelStatus {
        let state = &self.channels[channel.index()];
        if !state.armed {
            return ChannelStatus::Idle;
        }
        if is_future(state.rise_ticks, self.counter) {
            ChannelStatus::Armed
        } else if is_future(state.fall_ticks, self.counter) {
            ChannelStatus::Active
        } else {
            ChannelStatus::Idle
        }
    }
}
