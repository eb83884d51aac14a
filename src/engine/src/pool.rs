//! Pools of objects recycled on GPU fence values.

use std::collections::VecDeque;

/// A pool of objects that become reusable once the GPU passes the fence
/// value they were returned with.
///
/// Entries are kept in return order, so the head always carries the lowest
/// fence value. Callers that share a pool across threads wrap it in a mutex.
#[derive(Debug)]
pub struct FencePool<T> {
    pool: VecDeque<(u64, T)>,
}

impl<T> Default for FencePool<T> {
    fn default() -> Self {
        FencePool {
            pool: VecDeque::new(),
        }
    }
}

impl<T> FencePool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn return_to_pool(&mut self, value: T, fence: u64) {
        debug_assert!(self.pool.back().map_or(true, |&(f, _)| f <= fence));
        self.pool.push_back((fence, value));
    }

    /// Pop the head if its fence has completed, otherwise create a new
    /// object.
    pub fn retrieve<E>(
        &mut self,
        completed_fence: u64,
        make_new: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        match self.pool.front() {
            Some(&(fence, _)) if fence <= completed_fence => {
                Ok(self.pool.pop_front().unwrap().1)
            }
            _ => make_new(),
        }
    }

    /// Drop at most one aged entry. An entry is aged once the completed
    /// fence has moved `threshold` past its return fence.
    pub fn trim(&mut self, threshold: u64, completed_fence: u64) {
        if let Some(&(fence, _)) = self.pool.front() {
            if fence <= completed_fence && completed_fence - fence >= threshold {
                self.pool.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// A [`FencePool`] with a cap on outstanding objects: at the cap, retrieval
/// blocks on the head's fence instead of creating another object.
#[derive(Debug)]
pub struct BoundedFencePool<T> {
    pool: FencePool<T>,
    max_in_flight: usize,
}

impl<T> BoundedFencePool<T> {
    pub fn new(max_in_flight: usize) -> Self {
        BoundedFencePool {
            pool: FencePool::new(),
            max_in_flight,
        }
    }

    /// Like [`FencePool::retrieve`], but when the pool is at capacity and
    /// the head is still in flight, `wait_for_fence` is invoked to block
    /// until the head's fence completes.
    pub fn retrieve<E>(
        &mut self,
        completed_fence: u64,
        mut wait_for_fence: impl FnMut(u64),
        make_new: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        match self.pool.pool.front() {
            None => return make_new(),
            Some(&(fence, _)) if fence > completed_fence => {
                if self.pool.pool.len() < self.max_in_flight {
                    return make_new();
                }
                wait_for_fence(fence);
            }
            _ => {}
        }
        Ok(self.pool.pool.pop_front().unwrap().1)
    }

    pub fn return_to_pool(&mut self, value: T, fence: u64) {
        self.pool.return_to_pool(value, fence);
    }
}

/// Size-bucketed fence pools handing out rounded-up allocations, used for
/// dynamic upload buffers. Bucket `i` holds objects of exactly
/// `(i + 1) * bucket_size` bytes.
#[derive(Debug)]
pub struct MultiLevelPool<T> {
    buckets: Vec<FencePool<T>>,
    bucket_size: u64,
    trim_threshold: u64,
}

impl<T> MultiLevelPool<T> {
    pub fn new(bucket_size: u64, trim_threshold: u64) -> Self {
        assert!(bucket_size.is_power_of_two());
        MultiLevelPool {
            buckets: Vec::new(),
            bucket_size,
            trim_threshold,
        }
    }

    fn index_for(&self, size: u64) -> usize {
        if size == 0 {
            0
        } else {
            ((size - 1) / self.bucket_size) as usize
        }
    }

    /// Size objects retrieved for `size` actually have.
    pub fn rounded_size(&self, size: u64) -> u64 {
        (self.index_for(size) as u64 + 1) * self.bucket_size
    }

    pub fn retrieve<E>(
        &mut self,
        size: u64,
        completed_fence: u64,
        make_new: impl FnOnce(u64) -> Result<T, E>,
    ) -> Result<T, E> {
        let index = self.index_for(size);
        let aligned = (index as u64 + 1) * self.bucket_size;
        if index >= self.buckets.len() {
            return make_new(aligned);
        }
        self.buckets[index].retrieve(completed_fence, || make_new(aligned))
    }

    pub fn return_to_pool(&mut self, size: u64, value: T, fence: u64) {
        let index = self.index_for(size);
        if index >= self.buckets.len() {
            self.buckets.resize_with(index + 1, FencePool::new);
        }
        self.buckets[index].return_to_pool(value, fence);
    }

    pub fn trim(&mut self, completed_fence: u64) {
        for bucket in &mut self.buckets {
            bucket.trim(self.trim_threshold, completed_fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieve_prefers_completed_head() {
        let mut pool = FencePool::new();
        pool.return_to_pool(1u32, 5);
        pool.return_to_pool(2u32, 9);

        // Head not yet complete: a new object is created.
        let got = pool.retrieve::<()>(4, || Ok(7)).unwrap();
        assert_eq!(got, 7);

        // Once the fence passes, the pooled object comes back before any
        // new one is made.
        let got = pool.retrieve::<()>(5, || panic!("should recycle")).unwrap();
        assert_eq!(got, 1);
        let got = pool.retrieve::<()>(5, || Ok(8)).unwrap();
        assert_eq!(got, 8);
    }

    #[test]
    fn trim_drops_one_aged_entry_per_pump() {
        let mut pool = FencePool::new();
        pool.return_to_pool(1u32, 1);
        pool.return_to_pool(2u32, 2);
        pool.trim(10, 20);
        assert_eq!(pool.len(), 1);
        pool.trim(10, 20);
        assert!(pool.is_empty());
    }

    #[test]
    fn bounded_pool_waits_at_capacity() {
        let mut pool = BoundedFencePool::new(1);
        pool.return_to_pool(1u32, 8);

        let mut waited_for = None;
        let got = pool
            .retrieve::<()>(3, |f| waited_for = Some(f), || panic!("at capacity"))
            .unwrap();
        assert_eq!(waited_for, Some(8));
        assert_eq!(got, 1);
    }

    #[test]
    fn multi_level_buckets_round_up() {
        let mut pool = MultiLevelPool::new(64 * 1024, 100);
        assert_eq!(pool.rounded_size(1), 64 * 1024);
        assert_eq!(pool.rounded_size(64 * 1024), 64 * 1024);
        assert_eq!(pool.rounded_size(64 * 1024 + 1), 128 * 1024);

        pool.return_to_pool(100, 1u32, 0);
        let got = pool
            .retrieve::<()>(90, 0, |_| panic!("same bucket"))
            .unwrap();
        assert_eq!(got, 1);
        let got = pool.retrieve::<()>(70 * 1024, 0, |size| Ok(size as u32)).unwrap();
        assert_eq!(got, 128 * 1024);
    }
}
