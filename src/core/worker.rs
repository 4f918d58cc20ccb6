//! Purpose: Worker side of the introspection IPC contract plus the bundled describer.
//! Exports: `Describe`, `ManifestDescriber`, `WorkerReply`, `serve_worker`, `reply_channel`.
//! Role: Runs inside the disposable worker process; never in the caller's process.
//! Invariants: A worker reads one request and writes exactly one reply line.
//! Invariants: Describe failures and panics are both reported as `WorkerReply::Failure`.
//! Invariants: Library output never shares a file descriptor with the reply.
#[cfg(unix)]
use std::fs::File;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::keyword::{KeywordInfo, LibraryKey, ParamSpec};

/// The load-and-describe primitive. Implementations may run arbitrary library code.
pub trait Describe {
    fn describe(&self, key: &LibraryKey) -> Result<Vec<KeywordInfo>, Error>;
}

/// The single message a worker sends back to its parent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Keywords { keywords: Vec<KeywordInfo> },
    Failure { message: String },
}

impl WorkerReply {
    pub fn into_result(self) -> Result<Vec<KeywordInfo>, Error> {
        match self {
            WorkerReply::Keywords { keywords } => Ok(keywords),
            WorkerReply::Failure { message } => Err(Error::new(ErrorKind::Introspection)
                .with_message(format!("library import failed: {message}"))),
        }
    }
}

/// Reads one JSON request from `input`, describes it, and writes one JSON reply line.
///
/// Returns an error only when the reply itself cannot be written; the caller
/// should exit the process either way.
pub fn serve_worker<D, R, W>(describer: &D, mut input: R, mut output: W) -> Result<(), Error>
where
    D: Describe,
    R: Read,
    W: Write,
{
    let mut raw = Vec::new();
    let reply = match input.read_to_end(&mut raw) {
        Ok(_) => match serde_json::from_slice::<LibraryKey>(&raw) {
            Ok(key) => describe_guarded(describer, &key),
            Err(err) => WorkerReply::Failure {
                message: format!("invalid worker request: {err}"),
            },
        },
        Err(err) => WorkerReply::Failure {
            message: format!("failed to read worker request: {err}"),
        },
    };

    let mut line = serde_json::to_vec(&reply).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("worker reply encode failed")
            .with_source(err)
    })?;
    line.push(b'\n');
    output
        .write_all(&line)
        .and_then(|()| output.flush())
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write worker reply")
                .with_source(err)
        })
}

/// Detaches the process stdout for the reply and points fd 1 at stderr.
///
/// Anything library code prints afterwards lands in the worker's stderr,
/// leaving the returned handle as the only writer of the reply pipe.
#[cfg(unix)]
pub fn reply_channel() -> Result<File, Error> {
    use std::os::fd::FromRawFd;

    let redirect_err = |what: &str| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to {what} worker stdout"))
            .with_source(io::Error::last_os_error())
    };
    io::stdout().flush().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to flush worker stdout")
            .with_source(err)
    })?;
    let private = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if private < 0 {
        return Err(redirect_err("duplicate"));
    }
    // Owned from here so the descriptor closes on the error path too.
    let reply = unsafe { File::from_raw_fd(private) };
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(redirect_err("redirect"));
    }
    Ok(reply)
}

fn describe_guarded<D: Describe>(describer: &D, key: &LibraryKey) -> WorkerReply {
    match panic::catch_unwind(AssertUnwindSafe(|| describer.describe(key))) {
        Ok(Ok(keywords)) => WorkerReply::Keywords { keywords },
        Ok(Err(err)) => WorkerReply::Failure {
            message: err.message().map(str::to_string).unwrap_or_else(|| err.to_string()),
        },
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            WorkerReply::Failure {
                message: format!("describer panicked: {detail}"),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: Option<String>,
    #[serde(default)]
    init: ParamSpec,
    #[serde(default)]
    keywords: Vec<ManifestKeyword>,
}

#[derive(Debug, Deserialize)]
struct ManifestKeyword {
    name: String,
    #[serde(default)]
    doc: String,
    #[serde(default)]
    args: ParamSpec,
}

/// Describes libraries declared as JSON manifests.
///
/// A manifest looks like
/// `{"name": "Foo", "init": {"names": ["host"]}, "keywords": [{"name": "bar", "doc": "...", "args": {"names": ["x", "y"], "defaults": ["1"]}}]}`.
/// `name` falls back to the file stem. Import arguments are checked against
/// `init` the way a library constructor would check them.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestDescriber;

impl Describe for ManifestDescriber {
    fn describe(&self, key: &LibraryKey) -> Result<Vec<KeywordInfo>, Error> {
        let path = Path::new(&key.path);
        let bytes = std::fs::read(path).map_err(|err| {
            Error::new(ErrorKind::Introspection)
                .with_message(format!("cannot read library '{}': {err}", key.path))
                .with_path(path)
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Introspection)
                .with_message(format!("invalid library manifest '{}': {err}", key.path))
                .with_path(path)
        })?;

        let source = manifest.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| key.path.clone())
        });
        check_init_args(&source, &manifest.init, &key.args)?;

        manifest
            .keywords
            .into_iter()
            .map(|kw| {
                Ok(KeywordInfo {
                    arguments: kw.args.flatten().map_err(|err| {
                        let detail = err.message().unwrap_or("invalid arguments").to_string();
                        Error::new(ErrorKind::Introspection)
                            .with_message(format!("keyword '{}': {detail}", kw.name))
                    })?,
                    name: kw.name,
                    doc: kw.doc,
                    source: source.clone(),
                })
            })
            .collect()
    }
}

fn check_init_args(library: &str, init: &ParamSpec, args: &[String]) -> Result<(), Error> {
    let min = init.required_count();
    let max = init.varargs.as_ref().map(|_| usize::MAX).unwrap_or(init.names.len());
    if args.len() >= min && args.len() <= max {
        return Ok(());
    }
    let expected = if max == usize::MAX {
        format!("at least {min}")
    } else if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    };
    Err(Error::new(ErrorKind::Introspection).with_message(format!(
        "library '{library}' expected {expected} arguments, got {}",
        args.len()
    )))
}
