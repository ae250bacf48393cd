use std::collections::BTreeSet;
use std::sync::Mutex;

/// Worker-local registry of free CPU cores and GPU devices.
///
/// All operations take one short-lived mutex; nothing blocks. Allocation
/// failure is a return value, never a wait.
pub(crate) struct ResourcePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    cpus_total: BTreeSet<u32>,
    gpus_total: BTreeSet<u32>,
    cpus_free: BTreeSet<u32>,
    gpus_free: BTreeSet<u32>,
}

impl ResourcePool {
    pub(crate) fn new(cpus: impl IntoIterator<Item = u32>, gpus: impl IntoIterator<Item = u32>) -> Self {
        let cpus_total: BTreeSet<u32> = cpus.into_iter().collect();
        let gpus_total: BTreeSet<u32> = gpus.into_iter().collect();
        Self {
            inner: Mutex::new(PoolInner {
                cpus_free: cpus_total.clone(),
                gpus_free: gpus_total.clone(),
                cpus_total,
                gpus_total,
            }),
        }
    }

    /// Atomically allocate `n_cpus` cores and `n_gpus` devices, lowest
    /// indices first. Returns `None` without mutating either set when
    /// there are not enough free members.
    pub(crate) fn try_allocate(
        &self,
        n_cpus: usize,
        n_gpus: usize,
    ) -> Option<(BTreeSet<u32>, BTreeSet<u32>)> {
        let mut inner = self.inner.lock().expect("resource pool lock poisoned");
        if inner.cpus_free.len() < n_cpus || inner.gpus_free.len() < n_gpus {
            return None;
        }

        let cpuset: BTreeSet<u32> = inner.cpus_free.iter().copied().take(n_cpus).collect();
        let gpuset: BTreeSet<u32> = inner.gpus_free.iter().copied().take(n_gpus).collect();
        for cpu in &cpuset {
            inner.cpus_free.remove(cpu);
        }
        for gpu in &gpuset {
            inner.gpus_free.remove(gpu);
        }
        Some((cpuset, gpuset))
    }

    /// Return previously allocated members to the free sets.
    pub(crate) fn release(&self, cpuset: &BTreeSet<u32>, gpuset: &BTreeSet<u32>) {
        let mut inner = self.inner.lock().expect("resource pool lock poisoned");
        for cpu in cpuset {
            debug_assert!(!inner.cpus_free.contains(cpu), "cpu {cpu} released twice");
            if inner.cpus_total.contains(cpu) {
                inner.cpus_free.insert(*cpu);
            }
        }
        for gpu in gpuset {
            debug_assert!(!inner.gpus_free.contains(gpu), "gpu {gpu} released twice");
            if inner.gpus_total.contains(gpu) {
                inner.gpus_free.insert(*gpu);
            }
        }
    }

    /// Subtract a resumed run's sets from the free pool.
    ///
    /// A member outside the configured pool is tolerated with a warning;
    /// the run keeps using it and `release` later drops it on the floor.
    pub(crate) fn adopt(&self, cpuset: &BTreeSet<u32>, gpuset: &BTreeSet<u32>) {
        let mut inner = self.inner.lock().expect("resource pool lock poisoned");
        for cpu in cpuset {
            if !inner.cpus_free.remove(cpu) {
                log::warn!("resumed run uses cpu {cpu} outside the configured pool");
            }
        }
        for gpu in gpuset {
            if !inner.gpus_free.remove(gpu) {
                log::warn!("resumed run uses gpu {gpu} outside the configured pool");
            }
        }
    }

    pub(crate) fn cpus_free(&self) -> usize {
        self.inner.lock().expect("resource pool lock poisoned").cpus_free.len()
    }

    pub(crate) fn gpus_free(&self) -> usize {
        self.inner.lock().expect("resource pool lock poisoned").gpus_free.len()
    }

    pub(crate) fn cpus_total(&self) -> usize {
        self.inner.lock().expect("resource pool lock poisoned").cpus_total.len()
    }

    pub(crate) fn gpus_total(&self) -> usize {
        self.inner.lock().expect("resource pool lock poisoned").gpus_total.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(members: &[u32]) -> BTreeSet<u32> {
        members.iter().copied().collect()
    }

    #[test]
    fn allocates_lowest_indices_first() {
        let pool = ResourcePool::new(0..4, 0..2);
        let (cpus, gpus) = pool.try_allocate(2, 1).unwrap();
        assert_eq!(cpus, set(&[0, 1]));
        assert_eq!(gpus, set(&[0]));

        let (cpus2, _) = pool.try_allocate(1, 0).unwrap();
        assert_eq!(cpus2, set(&[2]));
    }

    #[test]
    fn failed_allocation_mutates_nothing() {
        let pool = ResourcePool::new(0..2, std::iter::empty());
        assert!(pool.try_allocate(1, 1).is_none());
        assert!(pool.try_allocate(3, 0).is_none());
        assert_eq!(pool.cpus_free(), 2);

        let (cpus, gpus) = pool.try_allocate(2, 0).unwrap();
        assert_eq!(cpus, set(&[0, 1]));
        assert!(gpus.is_empty());
    }

    #[test]
    fn release_restores_conservation() {
        let pool = ResourcePool::new(0..4, 0..2);
        let (c1, g1) = pool.try_allocate(2, 1).unwrap();
        let (c2, g2) = pool.try_allocate(2, 1).unwrap();

        // Live sets are pairwise disjoint and exhaust the pool.
        assert!(c1.is_disjoint(&c2));
        assert!(g1.is_disjoint(&g2));
        assert_eq!(pool.cpus_free(), 0);
        assert_eq!(pool.gpus_free(), 0);

        pool.release(&c1, &g1);
        pool.release(&c2, &g2);
        assert_eq!(pool.cpus_free(), 4);
        assert_eq!(pool.gpus_free(), 2);
    }

    #[test]
    fn adopt_tolerates_members_outside_pool() {
        let pool = ResourcePool::new(0..2, std::iter::empty());
        pool.adopt(&set(&[1, 7]), &set(&[]));
        assert_eq!(pool.cpus_free(), 1);

        // Releasing the foreign core does not grow the pool past its total.
        pool.release(&set(&[1, 7]), &set(&[]));
        assert_eq!(pool.cpus_free(), 2);
    }
}
