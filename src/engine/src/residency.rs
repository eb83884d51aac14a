//! LRU residency management under an OS-assigned memory budget.

use rocl_hal as hal;
use rocl_hal::{Adapter as _, Backend, MemoryBudget};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Index of a tracked object inside the residency slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidencyHandle(u32);

const NONE: u32 = u32::MAX;

#[derive(Debug)]
struct ManagedObject<B: Backend> {
    memory: Option<Arc<B::Memory>>,
    size: u64,
    resident: bool,
    pinned: bool,
    in_set: bool,
    last_used_fence: u64,
    last_used: Instant,
    // LRU links, by slab index. The list is ordered least-recently-used
    // first and contains exactly the resident objects.
    prev: u32,
    next: u32,
}

/// The set of objects referenced by one command list.
#[derive(Debug, Default)]
pub struct ResidencySet {
    objects: Vec<ResidencyHandle>,
    open: bool,
}

impl ResidencySet {
    pub fn open(&mut self) {
        assert!(self.objects.is_empty());
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Tunables for the residency manager.
#[derive(Clone, Copy, Debug)]
pub struct ResidencyOptions {
    /// How long a cached budget query stays valid.
    pub budget_query_period: Duration,
    /// Grace period before an unused object may be aged out, under no
    /// budget pressure.
    pub max_eviction_grace: Duration,
    /// Grace period at full budget pressure.
    pub min_eviction_grace: Duration,
}

impl Default for ResidencyOptions {
    fn default() -> Self {
        ResidencyOptions {
            budget_query_period: Duration::from_secs(1),
            max_eviction_grace: Duration::from_secs(60),
            min_eviction_grace: Duration::from_secs(1),
        }
    }
}

/// Tracks every pageable GPU allocation of a device, keeps an LRU over the
/// resident ones, and pages objects in and out to fit the OS budget on each
/// submission.
pub struct ResidencyManager<B: Backend> {
    objects: Vec<ManagedObject<B>>,
    free: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    num_resident: usize,
    options: ResidencyOptions,
    cached_budget: MemoryBudget,
    last_budget_query: Option<Instant>,
}

impl<B: Backend> ResidencyManager<B> {
    pub fn new(options: ResidencyOptions) -> Self {
        ResidencyManager {
            objects: Vec::new(),
            free: Vec::new(),
            lru_head: NONE,
            lru_tail: NONE,
            num_resident: 0,
            options,
            cached_budget: MemoryBudget::default(),
            last_budget_query: None,
        }
    }

    /// Begin tracking a freshly created allocation. Creation makes memory
    /// resident, so the object starts on the LRU.
    pub fn track(&mut self, memory: Arc<B::Memory>, size: u64) -> ResidencyHandle {
        let object = ManagedObject {
            memory: Some(memory),
            size,
            resident: true,
            pinned: false,
            in_set: false,
            last_used_fence: 0,
            last_used: Instant::now(),
            prev: NONE,
            next: NONE,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = object;
                index
            }
            None => {
                self.objects.push(object);
                self.objects.len() as u32 - 1
            }
        };
        self.link_tail(index);
        self.num_resident += 1;
        ResidencyHandle(index)
    }

    pub fn untrack(&mut self, handle: ResidencyHandle) {
        let index = handle.0;
        if self.objects[index as usize].resident {
            self.unlink(index);
            self.num_resident -= 1;
        }
        self.objects[index as usize].memory = None;
        self.free.push(index);
    }

    pub fn set_pinned(&mut self, handle: ResidencyHandle, pinned: bool) {
        self.objects[handle.0 as usize].pinned = pinned;
    }

    pub fn is_resident(&self, handle: ResidencyHandle) -> bool {
        self.objects[handle.0 as usize].resident
    }

    /// Record `handle` into the set of objects the current command list
    /// references.
    pub fn insert(&mut self, set: &mut ResidencySet, handle: ResidencyHandle) {
        debug_assert!(set.is_open());
        let object = &mut self.objects[handle.0 as usize];
        if !object.in_set {
            object.in_set = true;
            set.objects.push(handle);
        }
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let o = &self.objects[index as usize];
            (o.prev, o.next)
        };
        if prev != NONE {
            self.objects[prev as usize].next = next;
        } else {
            self.lru_head = next;
        }
        if next != NONE {
            self.objects[next as usize].prev = prev;
        } else {
            self.lru_tail = prev;
        }
        let o = &mut self.objects[index as usize];
        o.prev = NONE;
        o.next = NONE;
    }

    fn link_tail(&mut self, index: u32) {
        let tail = self.lru_tail;
        self.objects[index as usize].prev = tail;
        self.objects[index as usize].next = NONE;
        if tail != NONE {
            self.objects[tail as usize].next = index;
        } else {
            self.lru_head = index;
        }
        self.lru_tail = index;
    }

    fn touch(&mut self, index: u32) {
        self.unlink(index);
        self.link_tail(index);
    }

    fn budget(&mut self, adapter: &B::Adapter, now: Instant) -> MemoryBudget {
        let stale = self
            .last_budget_query
            .map_or(true, |t| now.duration_since(t) >= self.options.budget_query_period);
        if stale {
            self.cached_budget = adapter.memory_budget();
            self.last_budget_query = Some(now);
        }
        self.cached_budget
    }

    /// Grace period before aged objects are evicted; shrinks linearly as
    /// usage approaches the budget.
    fn eviction_grace(&self, budget: MemoryBudget) -> Duration {
        let min = self.options.min_eviction_grace;
        let max = self.options.max_eviction_grace;
        if budget.budget == 0 {
            return min;
        }
        let pressure = (budget.usage as f64 / budget.budget as f64).min(1.0);
        let window = max.checked_sub(min).unwrap_or_default();
        min + window.mul_f64(1.0 - pressure)
    }

    fn evict_object(&mut self, index: u32, eviction: &mut Vec<Arc<B::Memory>>) {
        let object = &mut self.objects[index as usize];
        debug_assert!(object.resident && !object.pinned);
        object.resident = false;
        if let Some(memory) = &object.memory {
            eviction.push(Arc::clone(memory));
        }
        self.unlink(index);
        self.num_resident -= 1;
    }

    // Evict LRU-first until usage fits the budget, skipping pinned objects
    // and stopping at objects the GPU has not finished with.
    fn trim_to_fence(
        &mut self,
        mut usage: i64,
        budget: i64,
        completed_fence: u64,
        eviction: &mut Vec<Arc<B::Memory>>,
    ) {
        let mut cursor = self.lru_head;
        while cursor != NONE {
            if usage < budget {
                return;
            }
            let object = &self.objects[cursor as usize];
            if object.last_used_fence > completed_fence {
                return;
            }
            if object.pinned {
                cursor = object.next;
            } else {
                let size = object.size;
                self.evict_object(cursor, eviction);
                usage -= size as i64;
                // Eviction relinks the list; restart from the head.
                cursor = self.lru_head;
            }
        }
    }

    fn trim_aged(
        &mut self,
        completed_fence: u64,
        now: Instant,
        grace: Duration,
        eviction: &mut Vec<Arc<B::Memory>>,
    ) {
        let mut cursor = self.lru_head;
        while cursor != NONE {
            let object = &self.objects[cursor as usize];
            // The LRU is ordered by recency; the first object inside its
            // grace period ends the scan.
            if now.duration_since(object.last_used) <= grace {
                return;
            }
            if object.last_used_fence > completed_fence {
                return;
            }
            if object.pinned {
                cursor = object.next;
                continue;
            }
            let index = cursor;
            self.evict_object(index, eviction);
            cursor = self.lru_head;
        }
    }

    /// Process the residency set of a command list that is about to execute:
    /// mark its objects resident, age out stale ones, and page the evicted
    /// ones back in within the budget.
    ///
    /// `wait_for_fence` blocks until the GPU passes the given fence value
    /// and returns the new completed value; it is only invoked when paging
    /// in must steal space from in-flight objects.
    pub fn process_paging(
        &mut self,
        set: &mut ResidencySet,
        device: &B::Device,
        adapter: &B::Adapter,
        list_fence: u64,
        mut completed_fence: u64,
        mut wait_for_fence: impl FnMut(u64) -> u64,
    ) -> Result<(), hal::DeviceError> {
        let now = Instant::now();
        let mut make_resident: Vec<u32> = Vec::with_capacity(set.objects.len());
        let mut eviction: Vec<Arc<B::Memory>> = Vec::new();
        let mut size_to_make_resident = 0u64;

        for &handle in &set.objects {
            let object = &mut self.objects[handle.0 as usize];
            object.in_set = false;
            if object.memory.is_none() {
                continue;
            }
            if !object.resident {
                object.resident = true;
                size_to_make_resident += object.size;
                make_resident.push(handle.0);
                self.link_tail(handle.0);
                self.num_resident += 1;
            }
            let object = &mut self.objects[handle.0 as usize];
            object.last_used_fence = list_fence;
            object.last_used = now;
            self.touch(handle.0);
        }
        set.objects.clear();
        set.close();

        let budget = self.budget(adapter, now);
        let grace = self.eviction_grace(budget);
        self.trim_aged(completed_fence, now, grace, &mut eviction);
        if !eviction.is_empty() {
            let refs: Vec<&B::Memory> = eviction.iter().map(|m| &**m).collect();
            hal::Device::evict(device, &refs);
            eviction.clear();
        }

        if make_resident.is_empty() {
            return Ok(());
        }

        let mut next = 0usize;
        loop {
            let available = budget.budget as i64 - budget.usage as i64;
            let mut batch: Vec<u32> = Vec::new();
            let mut batch_size = 0u64;
            if available > 0 {
                while next < make_resident.len() {
                    let size = self.objects[make_resident[next] as usize].size;
                    if batch_size + size > available as u64 {
                        break;
                    }
                    batch_size += size;
                    batch.push(make_resident[next]);
                    next += 1;
                }
                if !batch.is_empty() {
                    self.make_resident_batch(device, &batch)?;
                    size_to_make_resident = size_to_make_resident.saturating_sub(batch_size);
                }
            }

            if next >= make_resident.len() {
                return Ok(());
            }

            // Not everything fit: find the oldest unpinned resident object
            // not referenced by this very submission.
            let mut head = self.lru_head;
            while head != NONE && self.objects[head as usize].pinned {
                head = self.objects[head as usize].next;
            }
            let force = head == NONE
                || self.objects[head as usize].last_used_fence >= list_fence;
            if force {
                // Nothing left to steal from; page in the remainder and let
                // the OS demote whatever it must.
                let remainder: Vec<u32> = make_resident[next..].to_vec();
                self.make_resident_batch(device, &remainder)?;
                return Ok(());
            }

            let wait_value = self.objects[head as usize].last_used_fence;
            completed_fence = wait_for_fence(wait_value);
            self.trim_to_fence(
                (budget.usage + size_to_make_resident) as i64,
                budget.budget as i64,
                completed_fence,
                &mut eviction,
            );
            if !eviction.is_empty() {
                let refs: Vec<&B::Memory> = eviction.iter().map(|m| &**m).collect();
                hal::Device::evict(device, &refs);
                eviction.clear();
            }
        }
    }

    fn make_resident_batch(
        &mut self,
        device: &B::Device,
        batch: &[u32],
    ) -> Result<(), hal::DeviceError> {
        let memories: Vec<Arc<B::Memory>> = batch
            .iter()
            .filter_map(|&i| self.objects[i as usize].memory.clone())
            .collect();
        let refs: Vec<&B::Memory> = memories.iter().map(|m| &**m).collect();
        hal::Device::make_resident(device, &refs)
    }

    /// Number of objects currently on the resident LRU, for tests.
    pub fn resident_count(&self) -> usize {
        self.num_resident
    }
}
