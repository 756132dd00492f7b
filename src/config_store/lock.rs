use crate::errors::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Advisory per-script locks. Waiters are served in FIFO order and a holder may
/// not lock the same id twice.
#[derive(Default)]
pub struct LockRegistry {
    slots: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    held: StdMutex<HashMap<Uuid, OwnedMutexGuard<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: Uuid) -> AppResult<Arc<Mutex<()>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| AppError::Internal("lock slot table poisoned".to_string()))?;
        Ok(slots.entry(id).or_default().clone())
    }

    fn hold(&self, id: Uuid, guard: OwnedMutexGuard<()>) -> AppResult<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::Internal("held lock table poisoned".to_string()))?;
        held.insert(id, guard);
        Ok(())
    }

    fn lease_for(self: &Arc<Self>, id: Uuid) -> LockLease {
        LockLease {
            registry: self.clone(),
            script_id: id,
            released: false,
        }
    }

    /// Waits in FIFO order for the lock. Only the returned lease can unlock it.
    pub async fn lock(self: &Arc<Self>, id: Uuid) -> AppResult<LockLease> {
        let slot = self.slot(id)?;
        let guard = slot.lock_owned().await;
        self.hold(id, guard)?;
        tracing::debug!(script_id = %id, "script lock acquired");
        Ok(self.lease_for(id))
    }

    pub fn try_lock(self: &Arc<Self>, id: Uuid) -> AppResult<LockLease> {
        let slot = self.slot(id)?;
        let guard = slot
            .try_lock_owned()
            .map_err(|_| AppError::Lock(format!("script {} is locked by a running task", id)))?;
        self.hold(id, guard)?;
        Ok(self.lease_for(id))
    }

    /// Releases the lease's lock. A lease from another registry is rejected and
    /// only releases its own registry when dropped.
    pub fn unlock(self: &Arc<Self>, lease: LockLease) -> AppResult<()> {
        if !Arc::ptr_eq(self, &lease.registry) {
            return Err(AppError::Lock(format!(
                "lease for script {} belongs to another store",
                lease.script_id
            )));
        }
        lease.release()
    }

    fn release(&self, id: Uuid) -> AppResult<()> {
        let guard = self
            .held
            .lock()
            .map_err(|_| AppError::Internal("held lock table poisoned".to_string()))?
            .remove(&id);
        match guard {
            Some(guard) => {
                drop(guard);
                tracing::debug!(script_id = %id, "script lock released");
                Ok(())
            }
            None => Err(AppError::Lock(format!("script {} is not locked", id))),
        }
    }

    pub fn is_locked(&self, id: Uuid) -> bool {
        self.held
            .lock()
            .map(|held| held.contains_key(&id))
            .unwrap_or(false)
    }
}

pub struct LockLease {
    registry: Arc<LockRegistry>,
    script_id: Uuid,
    released: bool,
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("script_id", &self.script_id)
            .field("released", &self.released)
            .finish()
    }
}

impl LockLease {
    pub fn script_id(&self) -> Uuid {
        self.script_id
    }

    pub fn release(mut self) -> AppResult<()> {
        self.released = true;
        self.registry.release(self.script_id)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(error) = self.registry.release(self.script_id) {
            tracing::warn!(script_id = %self.script_id, error = %error, "failed to release script lock");
        }
    }
}
