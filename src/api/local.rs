//! Purpose: Assemble the default file-backed, process-isolated cache.
//! Exports: `LocalCache`, `LocalOptions`.
//! Role: One place where CLI flags and embedding hosts turn settings into a `Cache`.
//! Invariants: Database resolution matches `default_db_path` unless overridden.
//! Invariants: Without an explicit worker, the running executable's `worker` subcommand is used.

use crate::core::cache::{Cache, CacheConfig};
use crate::core::error::Error;
use crate::core::introspect::{IntrospectorConfig, ProcessIntrospector, WorkerCommand};
use crate::core::store::FileStore;
use crate::db_paths::default_db_path;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type ApiResult<T> = Result<T, Error>;

pub type LocalCache = Cache<FileStore, ProcessIntrospector>;

#[derive(Clone, Debug)]
pub struct LocalOptions {
    db_path: PathBuf,
    worker: Option<WorkerCommand>,
    poll_interval: Option<Duration>,
    deadline: Option<Duration>,
    cache: CacheConfig,
}

impl LocalOptions {
    pub fn new() -> Self {
        Self {
            db_path: default_db_path(),
            worker: None,
            poll_interval: None,
            deadline: None,
            cache: CacheConfig::new(),
        }
    }

    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.cache = self.cache.with_stale_after(stale_after);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn introspector(&self) -> ApiResult<ProcessIntrospector> {
        let worker = match &self.worker {
            Some(worker) => worker.clone(),
            None => WorkerCommand::current_exe()?,
        };
        let mut config = IntrospectorConfig::new(worker).with_deadline(self.deadline);
        if let Some(poll_interval) = self.poll_interval {
            config = config.with_poll_interval(poll_interval);
        }
        Ok(ProcessIntrospector::new(config))
    }

    pub fn open(&self) -> ApiResult<LocalCache> {
        Ok(Cache::new(
            FileStore::new(&self.db_path),
            self.introspector()?,
            self.cache.clone(),
        ))
    }
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::LocalOptions;
    use crate::core::introspect::{DEFAULT_POLL_INTERVAL, WorkerCommand};
    use std::time::Duration;

    #[test]
    fn options_flow_into_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("db.json");
        let options = LocalOptions::new()
            .with_db_path(&db)
            .with_worker(WorkerCommand::new("/bin/true"))
            .with_deadline(Some(Duration::from_secs(3)))
            .with_stale_after(Duration::from_secs(1));

        let cache = options.open().expect("open");
        assert_eq!(cache.store().path(), db.as_path());
        assert_eq!(cache.config().stale_after, Duration::from_secs(1));

        let introspector = options.introspector().expect("introspector");
        assert_eq!(introspector.config().deadline, Some(Duration::from_secs(3)));
        assert_eq!(introspector.config().poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(introspector.config().worker, WorkerCommand::new("/bin/true"));
    }
}
