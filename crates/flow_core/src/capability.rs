use std::collections::BTreeSet;

use shared::{
    domain::{EquivalentCode, ParticipantId},
    protocol::PaymentTarget,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityKey {
    pub equivalent: EquivalentCode,
    pub from: ParticipantId,
}

impl CapabilityKey {
    pub fn new(equivalent: EquivalentCode, from: ParticipantId) -> Self {
        Self { equivalent, from }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityState {
    Loading,
    /// May be empty: "no routes" is a known answer, distinct from loading.
    Known(BTreeSet<ParticipantId>),
    Degraded(String),
}

impl CapabilityState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_known_empty(&self) -> bool {
        matches!(self, Self::Known(set) if set.is_empty())
    }

    pub fn reachable(&self) -> Option<&BTreeSet<ParticipantId>> {
        match self {
            Self::Known(set) => Some(set),
            Self::Loading | Self::Degraded(_) => None,
        }
    }

    pub fn admits(&self, to: &ParticipantId) -> bool {
        self.reachable().map_or(true, |set| set.contains(to))
    }

    pub fn error_hint(&self) -> Option<&str> {
        match self {
            Self::Degraded(message) => Some(message),
            _ => None,
        }
    }
}

/// Handle for one issued fetch. Only the ticket matching the most recent
/// observation may write its result back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    key: CapabilityKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &CapabilityKey {
        &self.key
    }
}

#[derive(Debug, Default)]
pub struct CapabilityCache {
    active: Option<CapabilityKey>,
    entry: Option<CapabilityState>,
    generation: u64,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_key(&self) -> Option<&CapabilityKey> {
        self.active.as_ref()
    }

    pub fn state(&self) -> Option<&CapabilityState> {
        self.entry.as_ref()
    }

    pub fn observe(&mut self, key: CapabilityKey) -> Option<FetchTicket> {
        if self.active.as_ref() == Some(&key) {
            return None;
        }
        self.generation += 1;
        self.active = Some(key.clone());
        self.entry = Some(CapabilityState::Loading);
        Some(FetchTicket {
            key,
            generation: self.generation,
        })
    }

    pub fn invalidate(&mut self) {
        if self.active.is_none() && self.entry.is_none() {
            return;
        }
        self.generation += 1;
        self.active = None;
        self.entry = None;
    }

    pub fn resolve(
        &mut self,
        ticket: &FetchTicket,
        result: Result<Vec<PaymentTarget>, String>,
    ) -> Option<&CapabilityState> {
        if ticket.generation != self.generation || self.active.as_ref() != Some(&ticket.key) {
            debug!(
                from = %ticket.key.from,
                equivalent = %ticket.key.equivalent,
                "capabilities: discarding stale payment targets"
            );
            return None;
        }

        let state = match result {
            Ok(targets) => CapabilityState::Known(
                targets
                    .into_iter()
                    .map(|target| target.to_id)
                    .filter(|to| *to != ticket.key.from)
                    .collect(),
            ),
            Err(message) => CapabilityState::Degraded(message),
        };
        self.entry = Some(state);
        self.entry.as_ref()
    }
}

#[cfg(test)]
#[path = "tests/capability_tests.rs"]
mod tests;
