//! Fence-delayed destruction of GPU-referenced objects.

use crate::buddy::Suballocation;
use crate::residency::{ResidencyHandle, ResidencyManager};
use crate::state::StateId;

use rocl_hal::{Backend, HeapKind};

use std::collections::VecDeque;
use std::sync::Arc;

/// What a retired buffer gives back once the GPU is done with it.
#[derive(Debug)]
pub enum RetiredPayload<B: Backend> {
    /// Sole owner of the underlying allocation; dropping it frees the
    /// memory.
    Owned(Arc<B::Memory>),
    /// A block borrowed from one of the pooled heaps.
    Suballocated { heap: HeapKind, block: Suballocation },
    /// A rolled-over shader-visible descriptor heap.
    DescriptorHeap(Arc<B::DescriptorHeap>),
}

#[derive(Debug)]
struct Retired<B: Backend> {
    last_used_fence: u64,
    payload: RetiredPayload<B>,
    residency: Option<ResidencyHandle>,
    state: Option<StateId>,
}

/// GPU-referenced objects cannot be destroyed at release time; they queue
/// here keyed by the last command-list id that used them and are freed when
/// the fence passes it.
#[derive(Debug, Default)]
pub struct DeferredDeletionQueue<B: Backend> {
    queue: VecDeque<Retired<B>>,
}

/// Callbacks the trim pass uses to give blocks back to their owners.
pub struct TrimSinks<'a, B: Backend> {
    pub residency: &'a mut ResidencyManager<B>,
    /// Drops the state-tracking record of a destroyed resource.
    pub release_state: &'a mut dyn FnMut(StateId),
    /// Returns a pooled block to the heap it was carved from.
    pub release_block: &'a mut dyn FnMut(HeapKind, Suballocation),
}

impl<B: Backend> DeferredDeletionQueue<B> {
    pub fn new() -> Self {
        DeferredDeletionQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn retire(
        &mut self,
        last_used_fence: u64,
        payload: RetiredPayload<B>,
        residency: Option<ResidencyHandle>,
        state: Option<StateId>,
    ) {
        self.queue.push_back(Retired {
            last_used_fence,
            payload,
            residency,
            state,
        });
    }

    /// Destroy everything the GPU has finished with. `completed_fence` of
    /// `u64::MAX` drains the queue at device teardown.
    pub fn trim(&mut self, completed_fence: u64, sinks: &mut TrimSinks<B>) {
        while let Some(head) = self.queue.front() {
            if head.last_used_fence > completed_fence {
                break;
            }
            let retired = self.queue.pop_front().unwrap();
            if let Some(handle) = retired.residency {
                sinks.residency.untrack(handle);
            }
            if let Some(state) = retired.state {
                (sinks.release_state)(state);
            }
            match retired.payload {
                RetiredPayload::Owned(memory) => drop(memory),
                RetiredPayload::Suballocated { heap, block } => {
                    (sinks.release_block)(heap, block)
                }
                RetiredPayload::DescriptorHeap(heap) => drop(heap),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
