//! Bounded pool of lazily created, reusable entries.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use fleet_types::{DispatchError, EntryId, EntryStatus};

struct Entry<H> {
    id: EntryId,
    handle: Arc<H>,
    status: EntryStatus,
    created_at: Instant,
}

struct State<H> {
    entries: Vec<Entry<H>>,
    /// Slots reserved by acquirers that are still running `create`.
    creating: usize,
    next_id: u64,
    closed: bool,
}

struct Inner<H> {
    label: &'static str,
    max_size: usize,
    /// One permit per entry that may be Busy (or being created) at once.
    /// Tokio's semaphore queues waiters FIFO.
    permits: Arc<Semaphore>,
    state: Mutex<State<H>>,
}

impl<H> Inner<H> {
    fn state(&self) -> MutexGuard<'_, State<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, id: EntryId, status: EntryStatus) -> bool {
        let mut state = self.state();
        match state.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: EntryId) -> Option<Arc<H>> {
        let mut state = self.state();
        let idx = state.entries.iter().position(|e| e.id == id)?;
        Some(state.entries.remove(idx).handle)
    }
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub status: EntryStatus,
    pub created_at: Instant,
}

/// Bounded pool of entries of type `H`.
///
/// Invariants:
/// - `size() <= max_size()` at all times; growth only happens through
///   `acquire` when no idle entry exists.
/// - An entry is Busy exactly while one [`Lease`] for it is alive.
pub struct Pool<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for Pool<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H> std::fmt::Debug for Pool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Pool")
            .field("label", &self.inner.label)
            .field("max_size", &self.inner.max_size)
            .field("size", &state.entries.len())
            .field("creating", &state.creating)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Releases a creation reservation even if the acquiring future is dropped
/// mid-create.
struct Reservation<'a, H> {
    inner: &'a Inner<H>,
}

impl<H> Drop for Reservation<'_, H> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.creating = state.creating.saturating_sub(1);
    }
}

impl<H> Pool<H> {
    /// `max_size` below 1 is raised to 1.
    #[must_use]
    pub fn new(label: &'static str, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(Inner {
                label,
                max_size,
                permits: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(State {
                    entries: Vec::with_capacity(max_size),
                    creating: 0,
                    next_id: 1,
                    closed: false,
                }),
            }),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.state().entries.len()
    }

    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.inner
            .state()
            .entries
            .iter()
            .filter(|e| !e.status.is_idle())
            .count()
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.size() - self.busy_count()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() >= self.inner.max_size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    #[must_use]
    pub fn handles(&self) -> Vec<Arc<H>> {
        self.inner
            .state()
            .entries
            .iter()
            .map(|e| Arc::clone(&e.handle))
            .collect()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.inner
            .state()
            .entries
            .iter()
            .map(|e| EntrySnapshot {
                id: e.id,
                status: e.status,
                created_at: e.created_at,
            })
            .collect()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakPool<H> {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Claim an idle entry, or create one if there is room, or wait.
    ///
    /// Waiting is FIFO on the capacity semaphore. Holding a permit guarantees
    /// either an idle entry or a free slot, because every Busy entry and
    /// every in-progress creation holds a permit of its own. `create`
    /// receives the id the new entry will carry and runs outside the lock.
    pub async fn acquire<F, Fut>(&self, create: F) -> Result<Lease<H>, DispatchError>
    where
        F: FnOnce(EntryId) -> Fut,
        Fut: Future<Output = Result<H, DispatchError>>,
    {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::PoolClosed)?;

        let id = loop {
            {
                let mut state = self.inner.state();
                if state.closed {
                    return Err(DispatchError::PoolClosed);
                }
                if let Some(entry) = state.entries.iter_mut().find(|e| e.status.is_idle()) {
                    entry.status = EntryStatus::Busy;
                    tracing::trace!(pool = self.inner.label, entry = %entry.id, "Reusing idle entry");
                    return Ok(Lease::new(self, entry.id, Arc::clone(&entry.handle), permit));
                }
                if state.entries.len() + state.creating < self.inner.max_size {
                    state.creating += 1;
                    let id = EntryId::new(state.next_id);
                    state.next_id += 1;
                    break id;
                }
            }
            // A removed-while-busy entry can lag its lease by one release.
            tokio::task::yield_now().await;
        };

        let reservation = Reservation { inner: &self.inner };
        tracing::debug!(pool = self.inner.label, entry = %id, "Creating entry");
        let handle = Arc::new(create(id).await?);

        let mut state = self.inner.state();
        drop_reservation(&mut state, reservation);
        if state.closed {
            return Err(DispatchError::PoolClosed);
        }
        state.entries.push(Entry {
            id,
            handle: Arc::clone(&handle),
            status: EntryStatus::Busy,
            created_at: Instant::now(),
        });
        drop(state);
        Ok(Lease::new(self, id, handle, permit))
    }

    /// Remove an entry regardless of its status.
    ///
    /// Returns `None` if the entry is unknown or the pool was closed.
    pub fn remove(&self, id: EntryId) -> Option<Arc<H>> {
        let removed = self.inner.remove(id);
        if removed.is_some() {
            tracing::debug!(pool = self.inner.label, entry = %id, "Removed entry");
        }
        removed
    }

    /// Close the pool and hand back every entry for teardown.
    ///
    /// Waiting and future acquirers fail with [`DispatchError::PoolClosed`].
    pub fn close(&self) -> Vec<Arc<H>> {
        let drained: Vec<Arc<H>> = {
            let mut state = self.inner.state();
            state.closed = true;
            state.entries.drain(..).map(|e| e.handle).collect()
        };
        self.inner.permits.close();
        tracing::debug!(
            pool = self.inner.label,
            count = drained.len(),
            "Closed pool"
        );
        drained
    }
}

// Decrement under the already-held guard instead of re-locking in Drop.
fn drop_reservation<H>(state: &mut State<H>, reservation: Reservation<'_, H>) {
    std::mem::forget(reservation);
    state.creating = state.creating.saturating_sub(1);
}

/// Non-owning reference to a [`Pool`], for callbacks owned by entries.
pub struct WeakPool<H> {
    inner: Weak<Inner<H>>,
}

impl<H> Clone for WeakPool<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<H> WeakPool<H> {
    #[must_use]
    pub fn upgrade(&self) -> Option<Pool<H>> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }
}

/// Exclusive claim on one Busy entry.
///
/// Settle with [`Lease::release`] (back to Idle) or [`Lease::discard`]
/// (remove). Dropping an unsettled lease marks the entry Idle. The capacity
/// permit is returned after the entry has been settled.
pub struct Lease<H> {
    pool: Weak<Inner<H>>,
    id: EntryId,
    handle: Arc<H>,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl<H> Lease<H> {
    fn new(pool: &Pool<H>, id: EntryId, handle: Arc<H>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool: Arc::downgrade(&pool.inner),
            id,
            handle,
            settled: false,
            _permit: permit,
        }
    }

    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    /// Busy → Idle.
    pub fn release(mut self) {
        self.mark_idle();
    }

    /// Remove the entry from the pool. Returns `false` if it was already gone.
    pub fn discard(mut self) -> bool {
        self.settled = true;
        self.pool
            .upgrade()
            .is_some_and(|inner| inner.remove(self.id).is_some())
    }

    fn mark_idle(&mut self) {
        self.settled = true;
        if let Some(inner) = self.pool.upgrade() {
            inner.set_status(self.id, EntryStatus::Idle);
        }
    }
}

impl<H> Drop for Lease<H> {
    fn drop(&mut self) {
        if !self.settled {
            self.mark_idle();
        }
    }
}

impl<H> std::fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}
