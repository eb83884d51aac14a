//! Per-subresource resource state tracking and barrier generation.

use rocl_hal::ResourceState;

use smallvec::{smallvec, SmallVec};

bitflags::bitflags! {
    /// Modifiers for a requested transition.
    pub struct TransitionFlags: u32 {
        /// The destination state must match exactly; read-state accumulation
        /// is not acceptable (used before operations that decay state).
        const STATE_MATCH_EXACT = 0x1;
        /// Record the transition but don't count the resource as used by the
        /// current command list if no barrier ends up required.
        const NOT_USED_IF_NO_CHANGE = 0x2;
    }
}

/// Identifies one tracked resource inside the manager's slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateId(u32);

impl StateId {
    /// Raw slab index, stable until `unregister`.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A barrier the caller must record before the next submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierRecord {
    pub resource: StateId,
    /// Subresource index, or `ALL_SUBRESOURCES`.
    pub subresource: u32,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// Marker for a barrier covering every subresource at once.
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct SubresourceState {
    state: ResourceState,
    read_fence: u64,
    write_fence: u64,
}

impl Default for SubresourceState {
    fn default() -> Self {
        SubresourceState {
            state: ResourceState::COMMON,
            read_fence: 0,
            write_fence: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct DesiredState {
    // None = no transition requested for this subresource.
    state: Option<ResourceState>,
    flags: TransitionFlags,
}

impl Default for DesiredState {
    fn default() -> Self {
        DesiredState {
            state: None,
            flags: TransitionFlags::empty(),
        }
    }
}

// Most resources are buffers with a single subresource; keep that case
// inline.
#[derive(Debug)]
struct TrackedStates<T> {
    all_same: bool,
    states: SmallVec<[T; 1]>,
}

impl<T: Copy + Default> TrackedStates<T> {
    fn new(subresources: u32) -> Self {
        TrackedStates {
            all_same: true,
            states: smallvec![T::default(); subresources as usize],
        }
    }

    fn get(&self, index: u32) -> T {
        if self.all_same {
            self.states[0]
        } else {
            self.states[index as usize]
        }
    }

    fn set_all(&mut self, value: T) {
        self.all_same = true;
        self.states[0] = value;
    }

    fn set_one(&mut self, index: u32, value: T) {
        if self.all_same && self.states.len() > 1 {
            let fill = self.states[0];
            for s in self.states.iter_mut().skip(1) {
                *s = fill;
            }
            self.all_same = false;
        }
        let index = if self.states.len() == 1 { 0 } else { index as usize };
        self.states[index] = value;
        if self.states.len() == 1 {
            self.all_same = true;
        }
    }
}

#[derive(Debug)]
struct Record {
    subresources: u32,
    simultaneous_access: bool,
    pending: bool,
    live: bool,
    desired: TrackedStates<DesiredState>,
    current: TrackedStates<SubresourceState>,
}

/// Tracks desired vs. current state for every registered resource and turns
/// the difference into a minimal barrier batch per submission.
#[derive(Debug, Default)]
pub struct ResourceStateManager {
    records: Vec<Record>,
    free: Vec<u32>,
    pending: Vec<u32>,
    barriers: Vec<BarrierRecord>,
}

impl ResourceStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subresources: u32, simultaneous_access: bool) -> StateId {
        assert!(subresources > 0);
        let record = Record {
            subresources,
            simultaneous_access,
            pending: false,
            live: true,
            desired: TrackedStates::new(subresources),
            current: TrackedStates::new(subresources),
        };
        match self.free.pop() {
            Some(index) => {
                self.records[index as usize] = record;
                StateId(index)
            }
            None => {
                self.records.push(record);
                StateId(self.records.len() as u32 - 1)
            }
        }
    }

    pub fn unregister(&mut self, id: StateId) {
        let record = &mut self.records[id.0 as usize];
        record.live = false;
        record.pending = false;
        self.free.push(id.0);
    }

    /// Request that every subresource reach `state` before the next
    /// submission.
    pub fn transition(&mut self, id: StateId, state: ResourceState, flags: TransitionFlags) {
        let record = &mut self.records[id.0 as usize];
        record.desired.set_all(DesiredState {
            state: Some(state),
            flags,
        });
        if !record.pending {
            record.pending = true;
            self.pending.push(id.0);
        }
    }

    /// Request a transition for a single subresource.
    pub fn transition_subresource(
        &mut self,
        id: StateId,
        subresource: u32,
        state: ResourceState,
        flags: TransitionFlags,
    ) {
        let record = &mut self.records[id.0 as usize];
        assert!(subresource < record.subresources);
        record.desired.set_one(
            subresource,
            DesiredState {
                state: Some(state),
                flags,
            },
        );
        if !record.pending {
            record.pending = true;
            self.pending.push(id.0);
        }
    }

    /// Current state of one subresource, for hazard checks and tests.
    pub fn current_state(&self, id: StateId, subresource: u32) -> ResourceState {
        self.records[id.0 as usize].current.get(subresource).state
    }

    fn transition_required(
        current: ResourceState,
        destination: &mut ResourceState,
        flags: TransitionFlags,
    ) -> bool {
        if current == *destination {
            return false;
        }
        if flags.contains(TransitionFlags::STATE_MATCH_EXACT) {
            return true;
        }
        // Current already contains every requested bit.
        if current.contains(*destination) {
            *destination = current;
            return false;
        }
        // Accumulate read states to minimize future transitions; writes
        // replace.
        if !destination.is_write() && !current.is_write() && current != ResourceState::COMMON {
            *destination |= current;
        }
        true
    }

    /// Resolve all pending transitions into a barrier batch for the command
    /// list identified by `current_fence`.
    pub fn apply_all(&mut self, current_fence: u64) -> &[BarrierRecord] {
        self.barriers.clear();
        for index in self.pending.drain(..) {
            let record = &mut self.records[index as usize];
            record.pending = false;
            if !record.live {
                continue;
            }

            let all_at_once = record.desired.all_same && record.current.all_same;
            let count = if all_at_once { 1 } else { record.subresources };
            for i in 0..count {
                let desired = record.desired.get(i);
                let mut after = match desired.state {
                    Some(state) => state,
                    None => continue,
                };
                let current = record.current.get(i);
                let mut used = !desired
                    .flags
                    .contains(TransitionFlags::NOT_USED_IF_NO_CHANGE);

                let write_hazard = record.simultaneous_access
                    && after.is_write()
                    && current.write_fence == current_fence;
                if write_hazard {
                    // A write following a same-submission write needs a
                    // synchronizing barrier even without a state change.
                    self.barriers.push(BarrierRecord {
                        resource: StateId(index),
                        subresource: if all_at_once { ALL_SUBRESOURCES } else { i },
                        before: current.state,
                        after,
                    });
                    used = true;
                } else if !record.simultaneous_access {
                    if Self::transition_required(current.state, &mut after, desired.flags) {
                        self.barriers.push(BarrierRecord {
                            resource: StateId(index),
                            subresource: if all_at_once { ALL_SUBRESOURCES } else { i },
                            before: current.state,
                            after,
                        });
                        used = true;
                    }
                } else if current.read_fence == current_fence {
                    // Simultaneous-access resources skip barriers but keep
                    // accumulating the states seen this submission.
                    after |= current.state;
                }

                if used {
                    let new_state = SubresourceState {
                        state: after,
                        read_fence: current_fence,
                        write_fence: if after.is_write() {
                            current_fence
                        } else {
                            current.write_fence
                        },
                    };
                    if all_at_once {
                        record.current.set_all(new_state);
                    } else {
                        record.current.set_one(i, new_state);
                    }
                }
            }

            record.desired.set_all(DesiredState::default());
        }
        &self.barriers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_barrier_when_state_is_superset() {
        let mut mgr = ResourceStateManager::new();
        let id = mgr.register(1, false);

        mgr.transition(id, ResourceState::COPY_DEST, TransitionFlags::empty());
        assert_eq!(mgr.apply_all(1).len(), 1);

        // COPY_DEST -> read accumulates.
        mgr.transition(
            id,
            ResourceState::NON_PIXEL_SHADER_RESOURCE,
            TransitionFlags::empty(),
        );
        assert_eq!(mgr.apply_all(1).len(), 1);

        mgr.transition(id, ResourceState::COPY_SOURCE, TransitionFlags::empty());
        let barriers = mgr.apply_all(1);
        assert_eq!(barriers.len(), 1);
        assert!(barriers[0]
            .after
            .contains(ResourceState::NON_PIXEL_SHADER_RESOURCE | ResourceState::COPY_SOURCE));

        // Now a subset read needs no barrier at all.
        mgr.transition(
            id,
            ResourceState::NON_PIXEL_SHADER_RESOURCE,
            TransitionFlags::empty(),
        );
        assert!(mgr.apply_all(2).is_empty());
        assert!(mgr
            .current_state(id, 0)
            .contains(ResourceState::NON_PIXEL_SHADER_RESOURCE));
    }

    #[test]
    fn write_states_replace() {
        let mut mgr = ResourceStateManager::new();
        let id = mgr.register(1, false);
        mgr.transition(id, ResourceState::GENERIC_READ, TransitionFlags::empty());
        mgr.apply_all(1);
        mgr.transition(id, ResourceState::UNORDERED_ACCESS, TransitionFlags::empty());
        let barriers = mgr.apply_all(1);
        assert_eq!(barriers[0].after, ResourceState::UNORDERED_ACCESS);
        assert_eq!(mgr.current_state(id, 0), ResourceState::UNORDERED_ACCESS);
    }

    #[test]
    fn per_subresource_tracking_splits_from_fast_path() {
        let mut mgr = ResourceStateManager::new();
        let id = mgr.register(4, false);
        mgr.transition_subresource(id, 2, ResourceState::COPY_DEST, TransitionFlags::empty());
        let barriers: Vec<_> = mgr.apply_all(1).to_vec();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].subresource, 2);
        assert_eq!(mgr.current_state(id, 2), ResourceState::COPY_DEST);
        assert_eq!(mgr.current_state(id, 0), ResourceState::COMMON);
    }

    #[test]
    fn exact_match_forces_barrier() {
        let mut mgr = ResourceStateManager::new();
        let id = mgr.register(1, false);
        mgr.transition(id, ResourceState::GENERIC_READ, TransitionFlags::empty());
        mgr.apply_all(1);
        mgr.transition(
            id,
            ResourceState::COPY_SOURCE,
            TransitionFlags::STATE_MATCH_EXACT,
        );
        let barriers = mgr.apply_all(1);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].after, ResourceState::COPY_SOURCE);
    }

    #[test]
    fn simultaneous_access_skips_barriers_without_write_hazard() {
        let mut mgr = ResourceStateManager::new();
        let id = mgr.register(1, true);
        mgr.transition(id, ResourceState::UNORDERED_ACCESS, TransitionFlags::empty());
        assert!(mgr.apply_all(1).is_empty());

        // A second write in the same submission is a hazard and must
        // barrier.
        mgr.transition(id, ResourceState::UNORDERED_ACCESS, TransitionFlags::empty());
        assert!(!mgr.apply_all(1).is_empty());
    }
}
