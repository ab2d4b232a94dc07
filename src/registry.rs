use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Dense per-camera index, assigned in registration order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraSlot(pub u16);

impl CameraSlot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CameraSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub slot: CameraSlot,
    /// The identity had not been seen before.
    pub newly_registered: bool,
    /// This was the very first camera to register.
    pub first: bool,
}

/// Identity → slot table plus the number of cameras a frame must wait for.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    slots: Mutex<HashMap<String, CameraSlot>>,
    count: AtomicUsize,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing slot for `identity` or assigns the next one.
    pub fn register_or_lookup(&self, identity: &str) -> anyhow::Result<Registration> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow::anyhow!("camera registry lock poisoned"))?;
        if let Some(slot) = slots.get(identity) {
            return Ok(Registration { slot: *slot, newly_registered: false, first: false });
        }
        let next = slots.len();
        let index = u16::try_from(next)
            .map_err(|_| anyhow::anyhow!("too many cameras registered ({})", next))?;
        let slot = CameraSlot(index);
        slots.insert(identity.to_string(), slot);
        self.count.store(slots.len(), Ordering::Release);
        Ok(Registration { slot, newly_registered: true, first: next == 0 })
    }

    /// Number of registered cameras.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn identity_of(&self, slot: CameraSlot) -> Option<String> {
        let slots = self.slots.lock().ok()?;
        slots.iter().find(|(_, s)| **s == slot).map(|(id, _)| id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_is_idempotent() {
        let registry = CameraRegistry::new();
        let a = registry.register_or_lookup("north").unwrap();
        let b = registry.register_or_lookup("south").unwrap();
        let a2 = registry.register_or_lookup("north").unwrap();
        assert_eq!(a.slot, CameraSlot(0));
        assert!(a.first && a.newly_registered);
        assert_eq!(b.slot, CameraSlot(1));
        assert!(!b.first && b.newly_registered);
        assert_eq!(a2.slot, a.slot);
        assert!(!a2.newly_registered && !a2.first);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.identity_of(CameraSlot(1)).as_deref(), Some("south"));
    }

    #[test]
    fn test_concurrent_registration_assigns_dense_slots() {
        let registry = Arc::new(CameraRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = format!("cam-{}", i % 4);
                    registry.register_or_lookup(&id).unwrap().slot
                })
            })
            .collect();
        let mut slots: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap().0).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(registry.len(), 4);
    }
}
