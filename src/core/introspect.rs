//! Purpose: Run one library introspection inside a fresh, disposable worker process.
//! Exports: `Introspect`, `ProcessIntrospector`, `IntrospectorConfig`, `WorkerCommand`.
//! Role: Isolation boundary between the caller's process and untrusted load-time code.
//! Invariants: Exactly one worker per call; workers are never reused.
//! Invariants: Each poll checks for a reply before checking worker liveness.
//! Invariants: Every worker this module gives up on is killed and reaped.
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::keyword::{KeywordInfo, LibraryKey};
use crate::core::worker::WorkerReply;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL_BYTES: usize = 4096;

/// Produces the keyword list of a library.
pub trait Introspect: Send + Sync + 'static {
    fn introspect(&self, key: &LibraryKey) -> Result<Vec<KeywordInfo>, Error>;
}

impl<T: Introspect> Introspect for Arc<T> {
    fn introspect(&self, key: &LibraryKey) -> Result<Vec<KeywordInfo>, Error> {
        self.as_ref().introspect(key)
    }
}

/// Program and leading arguments used to start a worker.
///
/// The worker receives the `LibraryKey` as JSON on stdin and must print one
/// `WorkerReply` JSON line on stdout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable's hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self, Error> {
        let exe = std::env::current_exe().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to resolve current executable")
                .with_source(err)
        })?;
        Ok(Self::new(exe).arg("worker"))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[derive(Clone, Debug)]
pub struct IntrospectorConfig {
    pub worker: WorkerCommand,
    pub poll_interval: Duration,
    /// Hard wall-clock bound per call. `None` waits for as long as the worker lives.
    pub deadline: Option<Duration>,
}

impl IntrospectorConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ProcessIntrospector {
    config: IntrospectorConfig,
}

impl ProcessIntrospector {
    pub fn new(config: IntrospectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IntrospectorConfig {
        &self.config
    }
}

impl Introspect for ProcessIntrospector {
    fn introspect(&self, key: &LibraryKey) -> Result<Vec<KeywordInfo>, Error> {
        let mut child = self.config.worker.command().spawn().map_err(|err| {
            Error::new(ErrorKind::Introspection)
                .with_message("failed to spawn introspection worker")
                .with_path(&self.config.worker.program)
                .with_source(err)
        })?;
        tracing::debug!(pid = child.id(), path = %key.path, "spawned introspection worker");

        let (replies, stderr_tail) = match attach_pipes(&mut child, key) {
            Ok(pipes) => pipes,
            Err(err) => {
                reap(&mut child);
                return Err(err);
            }
        };
        let mut session = WorkerSession {
            child,
            replies,
            stderr_tail,
            poll: self.config.poll_interval,
        };
        let result = session.await_reply(self.config.deadline);
        session.finish();
        result
    }
}

/// What the stdout reader thread observed.
enum Delivery {
    Reply(WorkerReply),
    Closed,
    Garbled(String),
}

struct WorkerSession {
    child: Child,
    replies: Receiver<Delivery>,
    stderr_tail: Receiver<String>,
    poll: Duration,
}

impl WorkerSession {
    fn await_reply(&mut self, deadline: Option<Duration>) -> Result<Vec<KeywordInfo>, Error> {
        let started = Instant::now();
        loop {
            match self.replies.recv_timeout(self.poll) {
                Ok(delivery) => return self.settle(delivery),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.died("worker output reader stopped without a result"));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.exit_status()?.is_some() {
                // The reply may have been written right before exit.
                return match self.replies.recv_timeout(self.poll) {
                    Ok(delivery) => self.settle(delivery),
                    Err(_) => Err(self.died("worker exited without a result")),
                };
            }

            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    tracing::warn!(
                        pid = self.child.id(),
                        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "introspection worker exceeded deadline; killing"
                    );
                    reap(&mut self.child);
                    return Err(Error::new(ErrorKind::Timeout).with_message(format!(
                        "introspection did not finish within {} ms",
                        limit.as_millis()
                    )));
                }
            }
        }
    }

    fn settle(&mut self, delivery: Delivery) -> Result<Vec<KeywordInfo>, Error> {
        match delivery {
            Delivery::Reply(reply) => reply.into_result(),
            Delivery::Closed => Err(self.died("worker exited without a result")),
            Delivery::Garbled(detail) => Err(Error::new(ErrorKind::Introspection)
                .with_message(format!("worker sent an unreadable reply: {detail}"))),
        }
    }

    fn exit_status(&mut self) -> Result<Option<ExitStatus>, Error> {
        self.child.try_wait().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to poll introspection worker")
                .with_source(err)
        })
    }

    fn died(&mut self, what: &str) -> Error {
        reap(&mut self.child);
        let status = self
            .child
            .try_wait()
            .ok()
            .flatten()
            .map(|status| status.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        let mut message = format!("{what} ({status})");
        if let Ok(tail) = self.stderr_tail.recv_timeout(self.poll) {
            let tail = tail.trim();
            if !tail.is_empty() {
                message.push_str(": ");
                message.push_str(tail);
            }
        }
        Error::new(ErrorKind::Introspection).with_message(message)
    }

    fn finish(mut self) {
        reap(&mut self.child);
    }
}

fn attach_pipes(
    child: &mut Child,
    key: &LibraryKey,
) -> Result<(Receiver<Delivery>, Receiver<String>), Error> {
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(Error::new(ErrorKind::Internal).with_message("worker pipes were not captured"));
    };

    let request = serde_json::to_vec(key).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("worker request encode failed")
            .with_source(err)
    })?;
    // Written off the polling thread so a worker that never reads stdin still meets its deadline.
    spawn_named("libdesc-worker-stdin", move || send_request(stdin, &request))?;

    // Capacity 1: the worker contract allows exactly one reply.
    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
    spawn_named("libdesc-worker-stdout", move || {
        let _ = reply_tx.send(read_reply(stdout));
    })?;

    let (tail_tx, tail_rx) = mpsc::sync_channel(1);
    spawn_named("libdesc-worker-stderr", move || {
        let _ = tail_tx.send(read_tail(stderr, STDERR_TAIL_BYTES));
    })?;

    Ok((reply_rx, tail_rx))
}

fn send_request(mut stdin: ChildStdin, request: &[u8]) {
    match stdin.write_all(request) {
        Ok(()) => {}
        // A worker that ignores or dies before reading its request is judged by the poll loop.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("worker closed stdin before reading the request");
        }
        Err(err) => tracing::warn!(error = %err, "failed to send worker request"),
    }
}

/// Reads worker stdout until a line parses as a `WorkerReply`.
///
/// Library code may print to stdout before the reply; such lines are skipped.
/// If the stream ends with no reply, the last unreadable line is reported.
fn read_reply(stdout: impl Read) -> Delivery {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let mut unreadable = None;
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => match serde_json::from_str::<WorkerReply>(line.trim()) {
                Ok(reply) => return Delivery::Reply(reply),
                Err(err) => {
                    tracing::debug!(line = line.trim(), "skipping non-reply worker output");
                    unreadable = Some(err.to_string());
                }
            },
            Err(err) => return Delivery::Garbled(err.to_string()),
        }
    }
    match unreadable {
        Some(detail) => Delivery::Garbled(detail),
        None => Delivery::Closed,
    }
}

fn read_tail(mut stderr: impl Read, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

fn spawn_named<F>(name: &str, body: F) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map(|_| ())
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to spawn worker pipe reader")
                .with_source(err)
        })
}

fn reap(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::{Delivery, read_reply, read_tail};
    use crate::core::keyword::KeywordInfo;
    use crate::core::worker::WorkerReply;

    #[test]
    fn reply_reader_skips_blank_lines() {
        let reply = WorkerReply::Keywords {
            keywords: vec![KeywordInfo::new("bar", "", "Foo", ["x"])],
        };
        let mut raw = b"\n\n".to_vec();
        raw.extend(serde_json::to_vec(&reply).expect("json"));
        raw.push(b'\n');
        match read_reply(raw.as_slice()) {
            Delivery::Reply(got) => assert_eq!(got, reply),
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn library_prints_before_the_reply_are_skipped() {
        let reply = WorkerReply::Keywords {
            keywords: vec![KeywordInfo::new("bar", "", "Foo", ["x"])],
        };
        let mut raw = b"Loading library Foo\n{\"banner\": true}\n".to_vec();
        raw.extend(serde_json::to_vec(&reply).expect("json"));
        raw.push(b'\n');
        match read_reply(raw.as_slice()) {
            Delivery::Reply(got) => assert_eq!(got, reply),
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn empty_output_reads_as_closed() {
        assert!(matches!(read_reply(&b""[..]), Delivery::Closed));
    }

    #[test]
    fn garbage_output_is_reported() {
        assert!(matches!(read_reply(&b"Segmentation fault\n"[..]), Delivery::Garbled(_)));
    }

    #[test]
    fn stderr_tail_keeps_last_bytes() {
        let input = "a".repeat(3000) + &"b".repeat(3000);
        let tail = read_tail(input.as_bytes(), 4096);
        assert_eq!(tail.len(), 4096);
        assert!(tail.ends_with(&"b".repeat(3000)));
    }
}
