// Descriptor store sessions and the JSON-file backed implementation with fs2 locking.
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};
use crate::core::keyword::{KeywordInfo, LibraryKey};

const DOCUMENT_VERSION: u32 = 1;

/// Copy of one stored entry as returned by a point query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheEntry {
    pub key: LibraryKey,
    pub keywords: Vec<KeywordInfo>,
    pub last_updated: OffsetDateTime,
}

/// Factory for store sessions; one session is opened per logical operation.
pub trait DescriptorStore: Send + Sync + 'static {
    type Session: StoreSession;

    fn open(&self) -> Result<Self::Session, Error>;
}

/// Operations available while a session is held. Dropping the session releases it.
pub trait StoreSession {
    fn entry(&mut self, key: &LibraryKey) -> Result<Option<CacheEntry>, Error>;

    /// Replaces the keyword list and sets `last_updated` to `at`.
    fn insert(
        &mut self,
        key: &LibraryKey,
        keywords: &[KeywordInfo],
        at: OffsetDateTime,
    ) -> Result<(), Error>;

    /// Sets `last_updated` to `at` without altering content. Absent keys are left absent.
    fn touch(&mut self, key: &LibraryKey, at: OffsetDateTime) -> Result<(), Error>;

    fn get_last_updated(&mut self, key: &LibraryKey) -> Result<Option<OffsetDateTime>, Error> {
        Ok(self.entry(key)?.map(|entry| entry.last_updated))
    }

    fn fetch(&mut self, key: &LibraryKey) -> Result<Option<Vec<KeywordInfo>>, Error> {
        Ok(self.entry(key)?.map(|entry| entry.keywords))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    libraries: BTreeMap<String, StoredEntry>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            libraries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    path: String,
    args: Vec<String>,
    last_updated: String,
    keywords: Vec<KeywordInfo>,
}

/// Keyword cache persisted as a single JSON document.
///
/// Readers take a shared lock and writers an exclusive lock on a sidecar
/// `.lock` file, so several processes may share one database. Writes land in
/// a temporary file that is renamed over the document.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DescriptorStore for FileStore {
    type Session = FileSession;

    fn open(&self) -> Result<FileSession, Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                Error::new(ErrorKind::Store)
                    .with_message("failed to create database directory")
                    .with_path(parent)
                    .with_source(err)
            })?;
        }
        let lock_path = sidecar_path(&self.path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|err| {
                Error::new(ErrorKind::Store)
                    .with_message("failed to open database lock")
                    .with_path(&lock_path)
                    .with_source(err)
            })?;
        Ok(FileSession {
            path: self.path.clone(),
            lock_path,
            lock,
        })
    }
}

pub struct FileSession {
    path: PathBuf,
    lock_path: PathBuf,
    lock: File,
}

impl FileSession {
    fn shared(&self) -> Result<HeldLock<'_>, Error> {
        self.lock.lock_shared().map_err(|err| self.lock_error(err))?;
        Ok(HeldLock { file: &self.lock })
    }

    fn exclusive(&self) -> Result<HeldLock<'_>, Error> {
        self.lock.lock_exclusive().map_err(|err| self.lock_error(err))?;
        Ok(HeldLock { file: &self.lock })
    }

    fn lock_error(&self, err: io::Error) -> Error {
        Error::new(lock_error_kind(&err))
            .with_path(&self.lock_path)
            .with_source(err)
    }

    fn read_document(&self) -> Result<Document, Error> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Document::default()),
            Err(err) => {
                return Err(Error::new(ErrorKind::Io).with_path(&self.path).with_source(err));
            }
        };
        if bytes.is_empty() {
            return Ok(Document::default());
        }
        let doc: Document = serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("invalid database json")
                .with_path(&self.path)
                .with_source(err)
        })?;
        if doc.version != DOCUMENT_VERSION {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unsupported database version {}", doc.version))
                .with_path(&self.path));
        }
        Ok(doc)
    }

    fn write_document(&self, doc: &Document) -> Result<(), Error> {
        let bytes = serde_json::to_vec(doc).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("database encode failed")
                .with_source(err)
        })?;
        let tmp_path = sidecar_path(&self.path, "tmp");
        let io_err = |err: io::Error| Error::new(ErrorKind::Io).with_path(&tmp_path).with_source(err);
        let mut tmp = File::create(&tmp_path).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))
    }

    fn modify<F>(&self, apply: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Document) -> Result<bool, Error>,
    {
        let _guard = self.exclusive()?;
        let mut doc = self.read_document()?;
        if apply(&mut doc)? {
            self.write_document(&doc)?;
        }
        Ok(())
    }
}

impl StoreSession for FileSession {
    fn entry(&mut self, key: &LibraryKey) -> Result<Option<CacheEntry>, Error> {
        let doc = {
            let _guard = self.shared()?;
            self.read_document()?
        };
        let Some(stored) = doc.libraries.get(&entry_id(key)) else {
            return Ok(None);
        };
        if stored.path != key.path || stored.args != key.args {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("database entry id does not match its key")
                .with_path(&self.path));
        }
        let last_updated = OffsetDateTime::parse(&stored.last_updated, &Rfc3339).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("invalid last_updated timestamp")
                .with_path(&self.path)
                .with_source(err)
        })?;
        Ok(Some(CacheEntry {
            key: key.clone(),
            keywords: stored.keywords.clone(),
            last_updated,
        }))
    }

    fn insert(
        &mut self,
        key: &LibraryKey,
        keywords: &[KeywordInfo],
        at: OffsetDateTime,
    ) -> Result<(), Error> {
        let last_updated = format_timestamp(at)?;
        self.modify(|doc| {
            doc.libraries.insert(
                entry_id(key),
                StoredEntry {
                    path: key.path.clone(),
                    args: key.args.clone(),
                    last_updated,
                    keywords: keywords.to_vec(),
                },
            );
            Ok(true)
        })
    }

    fn touch(&mut self, key: &LibraryKey, at: OffsetDateTime) -> Result<(), Error> {
        let last_updated = format_timestamp(at)?;
        self.modify(|doc| match doc.libraries.get_mut(&entry_id(key)) {
            Some(stored) => {
                stored.last_updated = last_updated;
                Ok(true)
            }
            None => Ok(false),
        })
    }
}

struct HeldLock<'a> {
    file: &'a File,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn entry_id(key: &LibraryKey) -> String {
    // JSON encoding keeps the (path, args) split unambiguous before hashing.
    let encoded = serde_json::to_vec(key).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn format_timestamp(at: OffsetDateTime) -> Result<String, Error> {
    at.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Store,
    }
}

#[cfg(test)]
mod tests {
    use super::{DescriptorStore, FileStore, StoreSession, entry_id};
    use crate::core::error::ErrorKind;
    use crate::core::keyword::{KeywordInfo, LibraryKey};
    use time::{Duration, OffsetDateTime};

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("nested").join("keywords.json"));
        (dir, store)
    }

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + seconds).expect("timestamp")
    }

    #[test]
    fn missing_database_reads_as_empty() {
        let (_dir, store) = store();
        let mut session = store.open().expect("open");
        let key = LibraryKey::new("/lib/Foo.py", Vec::<String>::new());
        assert_eq!(session.get_last_updated(&key).expect("last updated"), None);
        assert_eq!(session.fetch(&key).expect("fetch"), None);
    }

    #[test]
    fn insert_then_fetch_across_sessions() {
        let (_dir, store) = store();
        let key = LibraryKey::new("/lib/Foo.py", ["a"]);
        let keywords = vec![KeywordInfo::new("bar", "does bar", "Foo", ["x", "y=1"])];
        store
            .open()
            .expect("open")
            .insert(&key, &keywords, at(0))
            .expect("insert");

        let mut session = store.open().expect("reopen");
        assert_eq!(session.fetch(&key).expect("fetch"), Some(keywords));
        assert_eq!(session.get_last_updated(&key).expect("ts"), Some(at(0)));
        let other = LibraryKey::new("/lib/Foo.py", ["b"]);
        assert_eq!(session.fetch(&other).expect("fetch other"), None);
    }

    #[test]
    fn insert_replaces_content() {
        let (_dir, store) = store();
        let key = LibraryKey::new("/lib/Foo.py", Vec::<String>::new());
        let mut session = store.open().expect("open");
        session
            .insert(&key, &[KeywordInfo::new("old", "", "Foo", Vec::<String>::new())], at(0))
            .expect("insert");
        let replacement = vec![KeywordInfo::new("new", "", "Foo", Vec::<String>::new())];
        session.insert(&key, &replacement, at(5)).expect("replace");
        let entry = session.entry(&key).expect("entry").expect("present");
        assert_eq!(entry.keywords, replacement);
        assert_eq!(entry.last_updated, at(5));
    }

    #[test]
    fn touch_updates_timestamp_only() {
        let (_dir, store) = store();
        let key = LibraryKey::new("/lib/Foo.py", Vec::<String>::new());
        let keywords = vec![KeywordInfo::new("bar", "", "Foo", ["x"])];
        let mut session = store.open().expect("open");
        session.insert(&key, &keywords, at(0)).expect("insert");
        session.touch(&key, at(0) + Duration::seconds(30)).expect("touch");

        let entry = session.entry(&key).expect("entry").expect("present");
        assert_eq!(entry.keywords, keywords);
        assert_eq!(entry.last_updated, at(30));
    }

    #[test]
    fn touch_on_absent_key_creates_nothing() {
        let (_dir, store) = store();
        let key = LibraryKey::new("/lib/Missing.py", Vec::<String>::new());
        let mut session = store.open().expect("open");
        session.touch(&key, at(0)).expect("touch");
        assert_eq!(session.entry(&key).expect("entry"), None);
    }

    #[test]
    fn corrupt_database_is_reported() {
        let (_dir, store) = store();
        let mut session = store.open().expect("open");
        std::fs::write(store.path(), b"not json").expect("write");
        let key = LibraryKey::new("/lib/Foo.py", Vec::<String>::new());
        let err = session.fetch(&key).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn entry_ids_separate_path_and_args() {
        let a = LibraryKey::new("ab", ["c"]);
        let b = LibraryKey::new("a", ["bc"]);
        assert_ne!(entry_id(&a), entry_id(&b));
        assert_eq!(entry_id(&a).len(), 64);
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Store);
    }

    #[test]
    fn separate_handles_do_not_lose_inserts() {
        let (_dir, store) = store();
        // Creates the parent directory before the writers race.
        drop(store.open().expect("open"));

        let handles: Vec<_> = (0..8)
            .map(|writer| {
                let path = store.path().to_path_buf();
                std::thread::spawn(move || {
                    let key = LibraryKey::new(format!("/lib/Lib{writer}.py"), Vec::<String>::new());
                    let keywords = vec![KeywordInfo::new("bar", "", format!("Lib{writer}"), ["x"])];
                    FileStore::new(path)
                        .open()
                        .expect("open")
                        .insert(&key, &keywords, at(writer))
                        .expect("insert");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let mut session = store.open().expect("reopen");
        for writer in 0..8 {
            let key = LibraryKey::new(format!("/lib/Lib{writer}.py"), Vec::<String>::new());
            assert_eq!(session.get_last_updated(&key).expect("ts"), Some(at(writer)));
        }
    }
}
