//! In-flight event state: the contributions gathered for one pulse id.

use crate::dgram::{Damage, Dgram, PulseId};

/// One event under assembly. Allocated on first arrival, accumulates
/// contributions until the arrived mask covers the contract, then is
/// delivered upward in pulse-id order.
#[derive(Debug, Clone)]
pub struct EbEvent {
    pid: u64,
    creator: Dgram,
    parameter: u64,
    contract: u64,
    arrived: u64,
    receivers: u64,
    damage: Damage,
    contributions: Vec<(u32, Dgram)>,
}

impl EbEvent {
    pub(crate) fn new(
        creator: Dgram,
        parameter: u64,
        contract: u64,
        receivers: u64,
        src: u32,
    ) -> Self {
        let pid = creator.pulse_id.value();
        let mut event = Self {
            pid,
            creator: creator.clone(),
            parameter,
            contract,
            arrived: 0,
            receivers,
            damage: Damage::none(),
            contributions: Vec::new(),
        };
        event.arrived = 1 << src;
        event.contributions.push((src, creator));
        event
    }

    /// Folds in another contribution. Returns false on a duplicate, which
    /// also marks the event damaged.
    pub(crate) fn add(&mut self, src: u32, dg: Dgram) -> bool {
        let bit = 1u64 << src;
        if self.arrived & bit != 0 {
            self.damage.increase(Damage::DUPLICATE_CONTRIBUTION);
            return false;
        }
        self.arrived |= bit;
        self.contributions.push((src, dg));
        true
    }

    pub fn is_complete(&self) -> bool {
        self.arrived & self.contract == self.contract
    }

    /// Promotes a stale event to complete, recording the missing
    /// contributors as damage.
    pub(crate) fn promote_stale(&mut self) {
        if !self.is_complete() {
            self.damage.increase(Damage::MISSING_CONTRIBUTION);
        }
    }

    pub fn pulse_id(&self) -> PulseId {
        self.creator.pulse_id
    }

    /// Time-ordered pulse value.
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Datagram that opened the event.
    pub fn creator(&self) -> &Dgram {
        &self.creator
    }

    /// Immediate data carried by the opening contribution.
    pub fn parameter(&self) -> u64 {
        self.parameter
    }

    /// Bitmask of contributors whose input this event still expects.
    pub fn missing(&self) -> u64 {
        self.contract & !self.arrived
    }

    /// Peers that must receive this event's result.
    pub fn receivers(&self) -> u64 {
        self.receivers
    }

    pub fn damage(&self) -> Damage {
        self.damage
    }

    /// Contributions in arrival order, tagged by contributor id.
    pub fn contributions(&self) -> &[(u32, Dgram)] {
        &self.contributions
    }
}
