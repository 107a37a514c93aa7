use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// The set of instances currently being updated.
/// Holding an [InstanceLockGuard] is the only way to be in the set.
#[derive(Default)]
pub struct InstanceLocks {
    updating: Mutex<HashSet<String>>,
}

impl InstanceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(InstanceLocks::default())
    }

    /// Atomically claim `name`, `None` if someone else already holds it
    pub fn try_acquire(self: &Arc<Self>, name: &str) -> Option<InstanceLockGuard> {
        let mut updating = self.updating.lock();
        match updating.insert(name.to_string()) {
            true => Some(InstanceLockGuard {
                locks: self.clone(),
                name: name.to_string(),
            }),
            false => None,
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.updating.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.updating.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.updating.lock().is_empty()
    }
}

/// Releases its instance when dropped
pub struct InstanceLockGuard {
    locks: Arc<InstanceLocks>,
    name: String,
}
impl Drop for InstanceLockGuard {
    fn drop(&mut self) {
        self.locks.updating.lock().remove(&self.name);
    }
}
