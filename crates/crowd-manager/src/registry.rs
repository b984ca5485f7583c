//! Bookkeeping for registered agents
//!
//! Slots are keyed by the address of the agent object and hold only a weak
//! reference, so the manager never keeps an agent alive.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crowd_common::PolyRef;
use crowd_engine::{LinkFilter, UpdateFlags};

use crate::agent::{CrowdAgent, is_simulated};

/// Identity of an agent object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AgentKey(usize);

impl AgentKey {
    pub(crate) fn of(agent: &dyn CrowdAgent) -> Self {
        Self(std::ptr::from_ref(agent).cast::<()>() as usize)
    }
}

/// Per-agent state kept next to the engine
pub(crate) struct AgentSlot {
    pub(crate) handle: Weak<dyn CrowdAgent>,
    /// Engine index, meaningful only while `is_valid` is set
    pub(crate) engine_idx: Option<usize>,
    pub(crate) link_filter: Option<Arc<dyn LinkFilter>>,
    pub(crate) is_simulated: bool,
    pub(crate) wants_path_optimization: bool,
    pub(crate) path_opt_remaining: f32,
    pub(crate) prev_poly: PolyRef,
    pub(crate) is_valid: bool,
}

impl AgentSlot {
    pub(crate) fn new(handle: &Arc<dyn CrowdAgent>) -> Self {
        let mut slot = Self {
            handle: Arc::downgrade(handle),
            engine_idx: None,
            link_filter: None,
            is_simulated: false,
            wants_path_optimization: false,
            path_opt_remaining: 0.0,
            prev_poly: PolyRef::NULL,
            is_valid: true,
        };
        slot.refresh(handle.as_ref());
        slot
    }

    /// Re-reads the simulation flags and the link filter from the agent
    pub(crate) fn refresh(&mut self, agent: &dyn CrowdAgent) {
        self.is_simulated = is_simulated(agent);
        let sim = agent.as_simulated();
        self.wants_path_optimization = self.is_simulated
            && sim.is_some_and(|s| s.update_flags().contains(UpdateFlags::OPTIMIZE_VIS));
        self.link_filter = sim.and_then(|s| s.link_filter());
    }

    /// Drops the slot's share of the link filter
    pub(crate) fn clear_filter(&mut self) {
        self.link_filter = None;
    }

    /// The index, if the slot is valid and placed in the engine
    pub(crate) fn index(&self) -> Option<usize> {
        if self.is_valid { self.engine_idx } else { None }
    }
}

#[derive(Default)]
pub(crate) struct AgentRegistry {
    slots: HashMap<AgentKey, AgentSlot>,
}

impl AgentRegistry {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn contains(&self, key: AgentKey) -> bool {
        self.slots.contains_key(&key)
    }

    pub(crate) fn insert(&mut self, key: AgentKey, slot: AgentSlot) {
        self.slots.insert(key, slot);
    }

    pub(crate) fn remove(&mut self, key: AgentKey) -> Option<AgentSlot> {
        self.slots.remove(&key)
    }

    pub(crate) fn get(&self, key: AgentKey) -> Option<&AgentSlot> {
        self.slots.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: AgentKey) -> Option<&mut AgentSlot> {
        self.slots.get_mut(&key)
    }

    /// Removes and returns the slots whose agent has been dropped
    pub(crate) fn take_dropped(&mut self) -> Vec<AgentSlot> {
        let dropped: Vec<AgentKey> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.handle.strong_count() == 0)
            .map(|(key, _)| *key)
            .collect();
        dropped
            .into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .collect()
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &AgentSlot> {
        self.slots.values()
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut AgentSlot> {
        self.slots.values_mut()
    }
}
