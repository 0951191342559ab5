//! Advisory per-component locks.
//!
//! Two workers must not render the same component at once. A guard is held
//! for the duration of one render and released on drop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::EngineError;

const RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct ComponentLocks {
    held: Arc<Mutex<HashSet<i64>>>,
}

#[derive(Debug)]
pub struct ComponentGuard {
    component_id: i64,
    held: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for ComponentGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.component_id);
    }
}

impl ComponentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, component_id: i64) -> Option<ComponentGuard> {
        let mut held = self.held.lock();
        if !held.insert(component_id) {
            return None;
        }
        Some(ComponentGuard {
            component_id,
            held: self.held.clone(),
        })
    }

    /// Acquire, retrying once after a short pause.
    pub async fn acquire(&self, component_id: i64) -> Result<ComponentGuard, EngineError> {
        if let Some(guard) = self.try_acquire(component_id) {
            return Ok(guard);
        }
        tokio::time::sleep(RETRY_DELAY).await;
        self.try_acquire(component_id).ok_or_else(|| {
            log::warn!("component {} is locked by another worker", component_id);
            EngineError::Concurrency(format!("component {component_id} is being generated"))
        })
    }

    pub fn is_locked(&self, component_id: i64) -> bool {
        self.held.lock().contains(&component_id)
    }
}
