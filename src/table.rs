//! Dense, slot-based table mapping local channel IDs to channels.
//!
//! IDs are allocated densely from `0` and reused once a channel is fully
//! torn down, via a free-list, rather than growing monotonically forever.

use std::sync::{Arc, Mutex};

use crate::channel::ChannelInner;

enum Slot {
    /// Available for (re)use; chained into the free-list via `next`.
    Empty { next: Option<u32> },
    /// Reserved by `reserve()` but not yet `install()`ed — an OPEN has been
    /// sent and we're waiting on OPEN_CONFIRM/OPEN_FAILURE.
    Reserved,
    /// A live channel.
    Occupied(Arc<ChannelInner>),
}

struct State {
    slots: Vec<Slot>,
    free_head: Option<u32>,
}

/// See the module docs.
pub(crate) struct ChannelTable {
    state: Mutex<State>,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        ChannelTable {
            state: Mutex::new(State {
                slots: Vec::new(),
                free_head: None,
            }),
        }
    }

    /// Allocate a fresh ID in the `Reserved` state and return it.
    pub(crate) fn reserve(&self) -> u32 {
        let mut state = self.state.lock().expect("table mutex poisoned");
        if let Some(id) = state.free_head {
            let next = match &state.slots[id as usize] {
                Slot::Empty { next } => *next,
                _ => unreachable!("free-list pointed at a non-empty slot"),
            };
            state.free_head = next;
            state.slots[id as usize] = Slot::Reserved;
            id
        } else {
            let id = state.slots.len() as u32;
            state.slots.push(Slot::Reserved);
            id
        }
    }

    /// Turn a `Reserved` slot into an `Occupied` one.
    pub(crate) fn install(&self, id: u32, channel: Arc<ChannelInner>) {
        let mut state = self.state.lock().expect("table mutex poisoned");
        state.slots[id as usize] = Slot::Occupied(channel);
    }

    /// Look up a live channel by ID.
    pub(crate) fn get(&self, id: u32) -> Option<Arc<ChannelInner>> {
        let state = self.state.lock().expect("table mutex poisoned");
        match state.slots.get(id as usize)? {
            Slot::Occupied(ch) => Some(ch.clone()),
            Slot::Empty { .. } | Slot::Reserved => None,
        }
    }

    /// Release `id` back to the free-list, whether it was `Reserved` (an
    /// OPEN that got OPEN_FAILURE) or `Occupied` (a fully closed channel).
    pub(crate) fn free(&self, id: u32) {
        let mut state = self.state.lock().expect("table mutex poisoned");
        let next = state.free_head;
        state.slots[id as usize] = Slot::Empty { next };
        state.free_head = Some(id);
    }

    /// Every currently occupied channel, for session-wide teardown.
    pub(crate) fn drain_occupied(&self) -> Vec<Arc<ChannelInner>> {
        let mut state = self.state.lock().expect("table mutex poisoned");
        let mut out = Vec::new();
        for (id, slot) in state.slots.iter_mut().enumerate() {
            if let Slot::Occupied(ch) = slot {
                out.push(ch.clone());
                *slot = Slot::Empty { next: None };
                let _ = id;
            }
        }
        // Rebuild the free-list over every newly-emptied slot plus whatever
        // was already free; a full drain only happens at session teardown
        // so we don't need to preserve allocation order.
        state.free_head = None;
        for id in (0..state.slots.len() as u32).rev() {
            if matches!(state.slots[id as usize], Slot::Empty { .. }) {
                let next = state.free_head;
                state.slots[id as usize] = Slot::Empty { next };
                state.free_head = Some(id);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_allocates_densely_from_zero() {
        let table = ChannelTable::new();
        assert_eq!(table.reserve(), 0);
        assert_eq!(table.reserve(), 1);
        assert_eq!(table.reserve(), 2);
    }

    #[test]
    fn freed_ids_are_reused_before_growing() {
        let table = ChannelTable::new();
        let a = table.reserve();
        let _b = table.reserve();
        table.free(a);
        let c = table.reserve();
        assert_eq!(c, a);
    }

    #[test]
    fn get_on_reserved_or_empty_slot_is_none() {
        let table = ChannelTable::new();
        let id = table.reserve();
        assert!(table.get(id).is_none());
        table.free(id);
        assert!(table.get(id).is_none());
    }
}
