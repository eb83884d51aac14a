//! CPU descriptor heap management.

use rocl_hal as hal;
use rocl_hal::{Backend, Descriptor, DescriptorKind, DeviceError};

use std::collections::VecDeque;
use std::ops::Range;

/// A slot in one of the manager's CPU heaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSlot {
    pub heap: u32,
    pub slot: u32,
}

struct HeapEntry<B: Backend> {
    heap: B::DescriptorHeap,
    // Sorted, coalesced free ranges of slots.
    free: Vec<Range<u32>>,
}

/// Allocates single descriptor slots out of a growing pool of fixed-size
/// CPU-only heaps, one manager per descriptor kind.
///
/// Heaps are never trimmed: handed-out slots stay valid for the lifetime of
/// the manager, which is what lets resources cache their view slots.
pub struct DescriptorHeapManager<B: Backend> {
    kind: DescriptorKind,
    heap_capacity: u32,
    heaps: VecDeque<HeapEntry<B>>,
    // Indices of heaps with at least one free slot.
    free_heaps: VecDeque<u32>,
}

impl<B: Backend> DescriptorHeapManager<B> {
    pub fn new(kind: DescriptorKind, heap_capacity: u32) -> Self {
        assert!(heap_capacity > 0);
        DescriptorHeapManager {
            kind,
            heap_capacity,
            heaps: VecDeque::new(),
            free_heaps: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Pop a slot from the first non-empty heap, growing the pool if needed.
    pub fn allocate_slot(&mut self, device: &B::Device) -> Result<CpuSlot, DeviceError> {
        if self.free_heaps.is_empty() {
            let heap = hal::Device::create_descriptor_heap(
                device,
                self.kind,
                self.heap_capacity,
                false,
            )?;
            self.heaps.push_back(HeapEntry {
                heap,
                free: vec![0..self.heap_capacity],
            });
            self.free_heaps.push_back(self.heaps.len() as u32 - 1);
        }

        let heap_index = *self.free_heaps.front().unwrap();
        let entry = &mut self.heaps[heap_index as usize];
        let range = entry.free.first_mut().unwrap();
        let slot = range.start;
        range.start += 1;
        if range.start == range.end {
            entry.free.remove(0);
            if entry.free.is_empty() {
                self.free_heaps.pop_front();
            }
        }
        Ok(CpuSlot {
            heap: heap_index,
            slot,
        })
    }

    /// Return a slot, merging it into adjacent free ranges.
    pub fn free_slot(&mut self, slot: CpuSlot) {
        let entry = &mut self.heaps[slot.heap as usize];
        let was_full = entry.free.is_empty();

        let pos = entry
            .free
            .iter()
            .position(|r| r.start > slot.slot)
            .unwrap_or(entry.free.len());

        let merges_prev = pos > 0 && entry.free[pos - 1].end == slot.slot;
        let merges_next = pos < entry.free.len() && entry.free[pos].start == slot.slot + 1;
        match (merges_prev, merges_next) {
            (true, true) => {
                entry.free[pos - 1].end = entry.free[pos].end;
                entry.free.remove(pos);
            }
            (true, false) => entry.free[pos - 1].end += 1,
            (false, true) => entry.free[pos].start -= 1,
            (false, false) => entry.free.insert(pos, slot.slot..slot.slot + 1),
        }

        if was_full {
            self.free_heaps.push_back(slot.heap);
        }
    }

    pub fn heap(&self, index: u32) -> &B::DescriptorHeap {
        &self.heaps[index as usize].heap
    }

    /// Write a descriptor into an allocated slot.
    pub fn write(&self, device: &B::Device, slot: CpuSlot, desc: Descriptor<B>) {
        hal::Device::write_descriptor(device, self.heap(slot.heap), slot.slot, desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocl_backend_null::{Backend as Null, Instance};
    use rocl_hal::{Adapter as _, Instance as _};

    fn device() -> <Null as Backend>::Device {
        let adapters = Instance::default().enumerate_adapters();
        adapters[0].open().unwrap().device
    }

    #[test]
    fn slots_recycle_and_coalesce() {
        let device = device();
        let mut mgr = DescriptorHeapManager::<Null>::new(DescriptorKind::View, 4);

        let slots: Vec<_> = (0..4).map(|_| mgr.allocate_slot(&device).unwrap()).collect();
        assert!(slots.iter().all(|s| s.heap == 0));

        // Free out of order; the ranges coalesce back into one.
        mgr.free_slot(slots[2]);
        mgr.free_slot(slots[0]);
        mgr.free_slot(slots[1]);
        mgr.free_slot(slots[3]);

        for expected in 0..4 {
            let again = mgr.allocate_slot(&device).unwrap();
            assert_eq!(
                again,
                CpuSlot {
                    heap: 0,
                    slot: expected
                }
            );
        }

        // Heap 0 is full again, the next allocation opens heap 1.
        let overflow = mgr.allocate_slot(&device).unwrap();
        assert_eq!(overflow.heap, 1);
    }
}
