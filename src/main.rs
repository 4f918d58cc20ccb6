//! Purpose: `libdesc` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout (pretty when stdout is a terminal).
//! Invariants: Errors are emitted as JSON on stderr unless stderr is a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: The hidden `worker` subcommand writes only its reply line to stdout.
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use libdesc::api::{
    DescriptorStore, Error, ErrorKind, FileStore, Introspect, LibraryKey, LocalOptions,
    LookupState, ManifestDescriber, RefreshOutcome, StoreSession, serve_worker, to_exit_code,
};
use libdesc::notice::{Notice, notice_json};

#[derive(Parser)]
#[command(
    name = "libdesc",
    version,
    about = "Describe library keywords through an isolated worker and a freshness-checked cache",
    long_about = None,
    after_help = r#"EXAMPLES
  $ libdesc import ./libs/Foo.json
  $ libdesc import ./libs/Remote.json example.com 8270
  $ libdesc show ./libs/Foo.json
  $ libdesc describe ./libs/Foo.json      # bypass the cache

NOTES
  - Default database: $LIBDESC_DB or ~/.libdesc/library_keywords.json (override with --db)
  - Entries older than --stale-after-ms are served, then refreshed in the background"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Descriptor database file",
        value_hint = ValueHint::FilePath
    )]
    db: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value_t = 10_000,
        help = "Age after which a cached entry is refreshed in the background"
    )]
    stale_after_ms: u64,
    #[arg(
        long,
        global = true,
        default_value_t = 100,
        help = "Interval between worker liveness checks"
    )]
    poll_ms: u64,
    #[arg(
        long,
        global = true,
        help = "Kill an introspection worker that runs longer than this"
    )]
    deadline_ms: Option<u64>,
    #[arg(
        long,
        global = true,
        default_value_t = 30_000,
        help = "How long to let background refresh/persist finish before exiting"
    )]
    background_wait_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Return a library's keywords through the cache")]
    Import(LibraryArgs),
    #[command(about = "Print the cached entry without introspecting")]
    Show(LibraryArgs),
    #[command(about = "Introspect a library in an isolated worker, bypassing the cache")]
    Describe(LibraryArgs),
    #[command(about = "Introspect now and update the cache if the keywords changed")]
    Refresh(LibraryArgs),
    #[command(hide = true)]
    Worker,
}

#[derive(Args)]
struct LibraryArgs {
    #[arg(help = "Library path", value_hint = ValueHint::FilePath)]
    path: String,
    #[arg(
        help = "Library arguments",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    args: Vec<String>,
}

impl LibraryArgs {
    fn key(&self) -> LibraryKey {
        LibraryKey::new(self.path.clone(), self.args.clone())
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `libdesc --help`."));
            }
        },
    };

    let mut options = LocalOptions::new()
        .with_stale_after(Duration::from_millis(cli.stale_after_ms))
        .with_poll_interval(Duration::from_millis(cli.poll_ms))
        .with_deadline(cli.deadline_ms.map(Duration::from_millis));
    if let Some(db) = cli.db {
        options = options.with_db_path(db);
    }
    let background_wait = Duration::from_millis(cli.background_wait_ms);

    match cli.command {
        Command::Worker => run_worker(),
        Command::Import(library) => run_import(&options, &library.key(), background_wait),
        Command::Show(library) => run_show(&options, &library.key()),
        Command::Describe(library) => {
            let key = library.key();
            let keywords = options.introspector()?.introspect(&key)?;
            emit_json(json!({ "library": library_json(&key), "keywords": keywords }));
            Ok(0)
        }
        Command::Refresh(library) => {
            let key = library.key();
            let outcome = options.open()?.refresh(&key, || {})?;
            let outcome = match outcome {
                RefreshOutcome::Changed => "changed",
                RefreshOutcome::Unchanged => "unchanged",
            };
            emit_json(json!({ "library": library_json(&key), "outcome": outcome }));
            Ok(0)
        }
    }
}

fn run_worker() -> Result<i32, Error> {
    let stdin = io::stdin();
    #[cfg(unix)]
    let output = libdesc::api::reply_channel()?;
    #[cfg(not(unix))]
    let output = io::stdout().lock();
    serve_worker(&ManifestDescriber, stdin.lock(), output)?;
    Ok(0)
}

fn run_import(options: &LocalOptions, key: &LibraryKey, background_wait: Duration) -> Result<i32, Error> {
    let cache = options.open()?;
    let (changed_tx, changed_rx) = mpsc::channel();
    let imported = cache.lookup(key, move || {
        let _ = changed_tx.send(());
    })?;
    let state = match imported.state {
        LookupState::Fresh => "fresh",
        LookupState::Stale => "stale",
        LookupState::Miss => "miss",
    };
    emit_json(json!({
        "library": library_json(key),
        "state": state,
        "keywords": imported.keywords,
    }));

    if !cache.wait_for_background(background_wait) {
        tracing::warn!(
            wait_ms = u64::try_from(background_wait.as_millis()).unwrap_or(u64::MAX),
            "background cache work still running at exit"
        );
    }
    if changed_rx.try_recv().is_ok() {
        let entry = cache.store().open().and_then(|mut session| session.entry(key));
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read refreshed entry for notice");
                None
            }
        };
        emit_notice(&Notice::keywords_changed(
            "import",
            key,
            entry.as_ref(),
            OffsetDateTime::now_utc(),
        ));
    }
    Ok(0)
}

fn run_show(options: &LocalOptions, key: &LibraryKey) -> Result<i32, Error> {
    let store = FileStore::new(options.db_path());
    let entry = store.open()?.entry(key)?.ok_or_else(|| {
        Error::new(ErrorKind::NotFound)
            .with_message(format!("no cached entry for '{}'", key.path))
            .with_path(store.path())
            .with_hint("Run `libdesc import <path> [args]...` first.")
    })?;
    emit_json(json!({
        "library": library_json(key),
        "last_updated": timestamp(entry.last_updated),
        "keywords": entry.keywords,
    }));
    Ok(0)
}

fn library_json(key: &LibraryKey) -> Value {
    json!({ "path": key.path, "args": key.args })
}

fn timestamp(at: OffsetDateTime) -> Option<String> {
    at.format(&Rfc3339).ok()
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_notice(notice: &Notice) {
    if io::stderr().is_terminal() {
        eprintln!("notice: {} (library: {})", notice.message, notice.library);
        return;
    }
    let json = serde_json::to_string(&notice_json(notice)).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Introspection => "library introspection failed".to_string(),
        ErrorKind::Timeout => "introspection timed out".to_string(),
        ErrorKind::Store => "descriptor store unavailable".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
