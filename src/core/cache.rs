//! Purpose: Stale-while-revalidate keyword cache in front of the isolated introspector.
//! Exports: `Cache`, `CacheConfig`, `Clock`, `SystemClock`, `WriteLock`, `Imported`, `LookupState`, `RefreshOutcome`.
//! Role: The single entry point callers use to obtain a library's keywords.
//! Invariants: Fresh and stale hits never wait on introspection.
//! Invariants: Store mutations happen only while the write lock is held.
//! Invariants: `on_changed` runs at most once per call, only after a changed list was stored.
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::core::diff::materially_changed;
use crate::core::error::Error;
use crate::core::introspect::Introspect;
use crate::core::keyword::{KeywordInfo, LibraryKey};
use crate::core::store::{DescriptorStore, StoreSession};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> OffsetDateTime {
        self.as_ref().now()
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Entries older than this are served and then refreshed in the background.
    pub stale_after: Duration,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes store mutations. Clone it to share one lock between caches over the same store.
#[derive(Clone, Debug, Default)]
pub struct WriteLock(Arc<Mutex<()>>);

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), so a poisoned lock carries no broken state.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupState {
    Fresh,
    /// Served from the store; a background refresh was started.
    Stale,
    /// Introspected synchronously; persisting continues in the background.
    Miss,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Imported {
    pub keywords: Vec<KeywordInfo>,
    pub state: LookupState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshOutcome {
    Changed,
    Unchanged,
}

struct Inner<S, I, C> {
    store: S,
    introspector: I,
    clock: C,
    config: CacheConfig,
    write_lock: WriteLock,
    background: Arc<Background>,
}

/// Count of detached tasks still running. Nothing joins them; hosts that are
/// about to exit may wait for the count to drain.
#[derive(Default)]
struct Background {
    running: Mutex<usize>,
    idle: Condvar,
}

impl Background {
    fn count(&self) -> MutexGuard<'_, usize> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(self: &Arc<Self>, name: &str, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.count() += 1;
        let done = TaskDone(Arc::clone(self));
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _done = done;
            body();
        });
        if let Err(err) = spawned {
            tracing::warn!(thread = name, error = %err, "failed to start background task");
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.count();
        while *running > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            running = match self.idle.wait_timeout(running, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

struct TaskDone(Arc<Background>);

impl Drop for TaskDone {
    fn drop(&mut self) {
        let mut running = self.0.count();
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct Cache<S, I, C = SystemClock> {
    inner: Arc<Inner<S, I, C>>,
}

impl<S, I, C> Clone for Cache<S, I, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, I> Cache<S, I, SystemClock>
where
    S: DescriptorStore,
    I: Introspect,
{
    pub fn new(store: S, introspector: I, config: CacheConfig) -> Self {
        Self::with_clock(store, introspector, config, SystemClock)
    }
}

impl<S, I, C> Cache<S, I, C>
where
    S: DescriptorStore,
    I: Introspect,
    C: Clock,
{
    pub fn with_clock(store: S, introspector: I, config: CacheConfig, clock: C) -> Self {
        Self::with_write_lock(store, introspector, config, clock, WriteLock::new())
    }

    pub fn with_write_lock(
        store: S,
        introspector: I,
        config: CacheConfig,
        clock: C,
        write_lock: WriteLock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                introspector,
                clock,
                config,
                write_lock,
                background: Arc::new(Background::default()),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Blocks until every detached refresh or persist started by this cache has
    /// finished, or `timeout` elapses. Returns whether the cache went idle.
    pub fn wait_for_background(&self, timeout: Duration) -> bool {
        self.inner.background.wait_idle(timeout)
    }

    /// Returns the keywords of the library at `path` constructed with `args`.
    ///
    /// Fresh entries are returned as stored. Stale entries are returned as
    /// stored while a detached refresh runs; `on_changed` fires from that
    /// refresh if it stored a materially different list. Missing entries are
    /// introspected synchronously and persisted in the background.
    pub fn import_library<P, A, S2, F>(
        &self,
        path: P,
        args: A,
        on_changed: F,
    ) -> Result<Vec<KeywordInfo>, Error>
    where
        P: Into<String>,
        A: IntoIterator<Item = S2>,
        S2: Into<String>,
        F: FnOnce() + Send + 'static,
    {
        let key = LibraryKey::new(path, args);
        self.lookup(&key, on_changed).map(|imported| imported.keywords)
    }

    /// Like `import_library`, also reporting which path the lookup took.
    pub fn lookup<F>(&self, key: &LibraryKey, on_changed: F) -> Result<Imported, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let entry = self.inner.store.open()?.entry(key)?;

        let Some(entry) = entry else {
            tracing::debug!(path = %key.path, "cache miss; introspecting");
            let keywords = self.inner.introspector.introspect(key)?;
            self.persist_in_background(key.clone(), keywords.clone());
            return Ok(Imported {
                keywords,
                state: LookupState::Miss,
            });
        };

        let age = self.inner.clock.now() - entry.last_updated;
        if age <= self.inner.config.stale_after {
            tracing::debug!(path = %key.path, "cache hit");
            return Ok(Imported {
                keywords: entry.keywords,
                state: LookupState::Fresh,
            });
        }

        tracing::debug!(
            path = %key.path,
            age_ms = i64::try_from(age.whole_milliseconds()).unwrap_or(i64::MAX),
            "stale cache hit; refreshing in background"
        );
        self.refresh_in_background(key.clone(), on_changed);
        Ok(Imported {
            keywords: entry.keywords,
            state: LookupState::Stale,
        })
    }

    /// Introspects `key` now and stores the result, inserting on material change and
    /// touching otherwise. `on_changed` runs after a changed list was stored.
    pub fn refresh<F>(&self, key: &LibraryKey, on_changed: F) -> Result<RefreshOutcome, Error>
    where
        F: FnOnce(),
    {
        let inner = &self.inner;
        let keywords = inner.introspector.introspect(key)?;

        // Compare and write under one lock hold so racing refreshes cannot interleave.
        let changed = {
            let _guard = inner.write_lock.acquire();
            let mut session = inner.store.open()?;
            let current = session.fetch(key)?;
            let changed = materially_changed(current.as_deref(), Some(keywords.as_slice()));
            if changed {
                session.insert(key, &keywords, inner.clock.now())?;
            } else {
                session.touch(key, inner.clock.now())?;
            }
            changed
        };

        if changed {
            tracing::debug!(path = %key.path, count = keywords.len(), "library keywords changed");
            on_changed();
            Ok(RefreshOutcome::Changed)
        } else {
            Ok(RefreshOutcome::Unchanged)
        }
    }

    fn refresh_in_background<F>(&self, key: LibraryKey, on_changed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cache = self.clone();
        self.inner.background.spawn("libdesc-refresh", move || {
            match cache.refresh(&key, on_changed) {
                Ok(_) => {}
                Err(err) if err.is_introspection_failure() => {
                    tracing::warn!(path = %key.path, error = %err, "library could not be introspected; keeping cached keywords");
                }
                Err(err) => {
                    tracing::warn!(path = %key.path, error = %err, "background refresh could not update the store");
                }
            }
        });
    }

    fn persist_in_background(&self, key: LibraryKey, keywords: Vec<KeywordInfo>) {
        let inner = Arc::clone(&self.inner);
        self.inner.background.spawn("libdesc-persist", move || {
            let _guard = inner.write_lock.acquire();
            let result = inner
                .store
                .open()
                .and_then(|mut session| session.insert(&key, &keywords, inner.clock.now()));
            if let Err(err) = result {
                tracing::warn!(path = %key.path, error = %err, "failed to persist introspected keywords");
            }
        });
    }
}
