// Process-isolation tests: worker crashes, hangs, and late replies never reach the caller's process.
use std::time::{Duration, Instant};

use libdesc::api::{
    Cache, CacheConfig, DescriptorStore, ErrorKind, FileStore, Introspect, IntrospectorConfig,
    KeywordInfo, LibraryKey, LookupState, ProcessIntrospector, StoreSession, WorkerCommand,
};

fn libdesc_worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_libdesc")).arg("worker")
}

#[cfg(unix)]
fn shell_worker(script: &str) -> WorkerCommand {
    WorkerCommand::new("/bin/sh").arg("-c").arg(script)
}

fn introspector(worker: WorkerCommand) -> ProcessIntrospector {
    ProcessIntrospector::new(
        IntrospectorConfig::new(worker).with_poll_interval(Duration::from_millis(20)),
    )
}

fn manifest(dir: &std::path::Path) -> LibraryKey {
    let path = dir.join("Foo.json");
    std::fs::write(
        &path,
        r#"{"keywords": [{"name": "bar", "doc": "does bar", "args": {"names": ["x", "y"], "defaults": ["1"], "varargs": "rest"}}]}"#,
    )
    .expect("write manifest");
    LibraryKey::new(path.to_string_lossy(), Vec::<String>::new())
}

#[test]
fn bundled_worker_describes_manifest() {
    let temp = tempfile::tempdir().expect("tempdir");
    let key = manifest(temp.path());

    let keywords = introspector(libdesc_worker())
        .introspect(&key)
        .expect("introspect");
    assert_eq!(
        keywords,
        vec![KeywordInfo::new("bar", "does bar", "Foo", ["x", "y=1", "*rest"])]
    );
}

#[test]
fn worker_side_failure_is_wrapped() {
    let key = LibraryKey::new("/no/such/library.json", Vec::<String>::new());
    let err = introspector(libdesc_worker())
        .introspect(&key)
        .expect_err("missing library");
    assert_eq!(err.kind(), ErrorKind::Introspection);
    assert!(err.message().expect("message").contains("library import failed"));
}

#[test]
fn missing_worker_program_fails_cleanly() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let err = introspector(WorkerCommand::new("/definitely/not/a/worker"))
        .introspect(&key)
        .expect_err("spawn failure");
    assert_eq!(err.kind(), ErrorKind::Introspection);
}

#[cfg(unix)]
#[test]
fn worker_exiting_without_reply_is_a_failure() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let err = introspector(shell_worker("exit 3"))
        .introspect(&key)
        .expect_err("silent exit");
    assert_eq!(err.kind(), ErrorKind::Introspection);
    assert!(err.message().expect("message").contains("without a result"));
}

#[cfg(unix)]
#[test]
fn crashing_worker_is_a_failure() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let err = introspector(shell_worker("echo 'native crash' >&2; kill -9 $$"))
        .introspect(&key)
        .expect_err("crash");
    assert_eq!(err.kind(), ErrorKind::Introspection);
}

#[cfg(unix)]
#[test]
fn reply_written_just_before_exit_is_not_lost() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let script = r#"cat >/dev/null; printf '%s\n' '{"status":"keywords","keywords":[{"name":"bar","doc":"","source":"Foo","arguments":["x"]}]}'; exit 0"#;
    for _ in 0..5 {
        let keywords = introspector(shell_worker(script))
            .introspect(&key)
            .expect("late reply");
        assert_eq!(keywords, vec![KeywordInfo::new("bar", "", "Foo", ["x"])]);
    }
}

#[cfg(unix)]
#[test]
fn library_output_before_reply_is_ignored() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let script = r#"cat >/dev/null; echo 'Loading library Foo'; printf '%s\n' '{"status":"keywords","keywords":[{"name":"bar","doc":"","source":"Foo","arguments":["x"]}]}'"#;
    let keywords = introspector(shell_worker(script))
        .introspect(&key)
        .expect("reply after banner");
    assert_eq!(keywords, vec![KeywordInfo::new("bar", "", "Foo", ["x"])]);
}

#[cfg(unix)]
#[test]
fn unreadable_reply_is_a_failure() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let err = introspector(shell_worker("echo 'Segmentation fault'"))
        .introspect(&key)
        .expect_err("garbage");
    assert_eq!(err.kind(), ErrorKind::Introspection);
}

#[cfg(unix)]
#[test]
fn hung_worker_is_killed_at_deadline() {
    let key = LibraryKey::new("/lib/Foo.json", Vec::<String>::new());
    let introspector = ProcessIntrospector::new(
        IntrospectorConfig::new(shell_worker("exec sleep 30"))
            .with_poll_interval(Duration::from_millis(20))
            .with_deadline(Some(Duration::from_millis(300))),
    );
    let started = Instant::now();
    let err = introspector.introspect(&key).expect_err("deadline");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[test]
fn deadline_holds_when_worker_never_reads_a_large_request() {
    let args: Vec<String> = (0..2000).map(|i| format!("{i:0>100}")).collect();
    let key = LibraryKey::new("/lib/Foo.json", args);
    let introspector = ProcessIntrospector::new(
        IntrospectorConfig::new(shell_worker("exec sleep 30"))
            .with_poll_interval(Duration::from_millis(20))
            .with_deadline(Some(Duration::from_millis(300))),
    );
    let started = Instant::now();
    let err = introspector.introspect(&key).expect_err("deadline");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn cache_miss_goes_through_worker_and_persists() {
    let temp = tempfile::tempdir().expect("tempdir");
    let key = manifest(temp.path());
    let store = FileStore::new(temp.path().join("db.json"));
    let cache = Cache::new(store, introspector(libdesc_worker()), CacheConfig::new());

    let imported = cache.lookup(&key, || {}).expect("lookup");
    assert_eq!(imported.state, LookupState::Miss);
    assert!(cache.wait_for_background(Duration::from_secs(5)));

    let stored = cache
        .store()
        .open()
        .expect("open")
        .fetch(&key)
        .expect("fetch")
        .expect("persisted");
    assert_eq!(stored, imported.keywords);

    let again = cache.lookup(&key, || {}).expect("lookup again");
    assert_eq!(again.state, LookupState::Fresh);
}
