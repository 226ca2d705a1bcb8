//! Purpose: `dfspipe` CLI entry point: produce to, consume from and list pipe topics.
//! Role: Binary crate root; parses args, builds a `Pipe`, runs one command.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: `consume` stops cleanly (exit 0) on SIGINT/SIGTERM or timeout.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use serde_json::{Map, Value, json};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use dfspipe::api::{
    CancelToken, Error, ErrorKind, Framing, Pipe, PipeConfig, PipeKind, Position, Record,
    to_exit_code,
};

#[derive(Parser, Debug)]
#[command(
    name = "dfspipe",
    version,
    about = "Rotating-file message pipes over HDFS and local disk",
    long_about = "Producers append records to rotating files under <base-dir>/<topic>;\n\
consumers stream finalized files in order and wait out files still being written.",
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    pipe: PipeArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PipeArgs {
    #[arg(long, global = true, help = "JSON config file", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, help = "Backend: hdfs|file")]
    kind: Option<KindArg>,
    #[arg(long, global = true, help = "Directory holding topic directories", value_hint = ValueHint::DirPath)]
    base_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "NameNode HTTP address, e.g. http://namenode:9870")]
    namenode: Option<String>,
    #[arg(long, global = true, help = "HDFS user name sent with WebHDFS requests")]
    user: Option<String>,
    #[arg(long, global = true, help = "Rotate files once they reach this many bytes")]
    max_file_size: Option<u64>,
    #[arg(long, global = true, value_enum, help = "Record framing: delimited|length-prefixed")]
    framing: Option<FramingArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum KindArg {
    Hdfs,
    File,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FramingArg {
    Delimited,
    LengthPrefixed,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append records to a topic (arguments, or one record per stdin line).
    Produce {
        topic: String,
        records: Vec<String>,
    },
    /// Stream records from a topic until canceled.
    Consume {
        topic: String,
        #[arg(long, help = "Stop after this many records")]
        max: Option<u64>,
        #[arg(long, help = "Stop after this many milliseconds")]
        timeout_ms: Option<u64>,
        #[arg(long, requires = "from_offset", help = "Resume in this finalized file")]
        from_file: Option<String>,
        #[arg(long, requires = "from_file", help = "Resume at this byte offset")]
        from_offset: Option<u64>,
        #[arg(long, help = "Emit one JSON object per record")]
        json: bool,
    },
    /// List a topic's pipe files in rotation order.
    Ls {
        topic: String,
        #[arg(long, help = "Emit a JSON array")]
        json: bool,
    },
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
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
                    .with_hint("Try `dfspipe --help`."));
            }
        },
    };

    init_tracing();
    let config = resolve_config(&cli.pipe)?;
    let pipe = Pipe::open(&config)?;

    let result = match cli.command {
        Command::Produce { topic, records } => produce(&pipe, &topic, records),
        Command::Consume {
            topic,
            max,
            timeout_ms,
            from_file,
            from_offset,
            json,
        } => {
            let from = from_file.zip(from_offset).map(|(file, offset)| Position { file, offset });
            consume(&pipe, &topic, max, timeout_ms.map(Duration::from_millis), from, json)
        }
        Command::Ls { topic, json } => list(&pipe, &topic, json),
    };
    result.map(|()| 0).map_err(add_unavailable_hint)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_config(args: &PipeArgs) -> Result<PipeConfig, Error> {
    let mut config = match &args.config {
        Some(path) => PipeConfig::from_path(path)?,
        None => PipeConfig::default(),
    };
    if let Some(kind) = args.kind {
        config.kind = match kind {
            KindArg::Hdfs => PipeKind::Hdfs,
            KindArg::File => PipeKind::File,
        };
    }
    if let Some(base_dir) = &args.base_dir {
        config.base_dir = base_dir.clone();
    }
    if let Some(namenode) = &args.namenode {
        config.hdfs.namenode = namenode.clone();
    }
    if let Some(user) = &args.user {
        config.hdfs.user = Some(user.clone());
    }
    if let Some(max_file_size) = args.max_file_size {
        config.max_file_size = max_file_size;
    }
    if let Some(framing) = args.framing {
        config.framing = match framing {
            FramingArg::Delimited => Framing::Delimited,
            FramingArg::LengthPrefixed => Framing::LengthPrefixed,
        };
    }
    config.validate()?;
    Ok(config)
}

fn produce(pipe: &Pipe, topic: &str, records: Vec<String>) -> Result<(), Error> {
    let mut producer = pipe.producer(topic)?;
    let mut count = 0u64;
    let outcome = if records.is_empty() {
        push_stdin(&mut producer, &mut count)
    } else {
        records.iter().try_for_each(|record| {
            producer.push(record.as_bytes())?;
            count += 1;
            Ok::<(), Error>(())
        })
    };
    match outcome {
        Ok(()) => producer.close()?,
        Err(err) => {
            if let Err(abandon_err) = producer.close_on_failure() {
                tracing::warn!(error = %abandon_err, "failed to remove in-progress file");
            }
            return Err(err);
        }
    }
    emit_json(&json!({ "topic": topic, "records": count }))
}

fn push_stdin(producer: &mut dfspipe::api::Producer, count: &mut u64) -> Result<(), Error> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = input.read_until(b'\n', &mut line).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })?;
        if read == 0 {
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        producer.push(&line)?;
        *count += 1;
    }
}

fn consume(
    pipe: &Pipe,
    topic: &str,
    max: Option<u64>,
    timeout: Option<Duration>,
    from: Option<Position>,
    json: bool,
) -> Result<(), Error> {
    let cancel = pipe.cancel_token();
    install_signal_cancel(&cancel)?;
    if let Some(timeout) = timeout {
        let token = cancel.clone();
        thread::spawn(move || {
            if !token.wait(timeout) {
                token.cancel();
            }
        });
    }

    let mut consumer = match &from {
        Some(position) => pipe.consumer_from(topic, position)?,
        None => pipe.consumer(topic)?,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut seen = 0u64;
    while max.is_none_or(|max| seen < max) {
        let Some(record) = consumer.fetch_next()? else {
            break;
        };
        write_record(&mut out, &record, json)?;
        seen += 1;
    }
    tracing::debug!(topic, records = seen, position = ?consumer.position(), "consume finished");
    Ok(())
}

fn install_signal_cancel(cancel: &CancelToken) -> Result<(), Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to install signal handlers")
            .with_source(err)
    })?;
    let token = cancel.clone();
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            tracing::debug!(signal, "stopping consumer");
            token.cancel();
        }
    });
    Ok(())
}

fn write_record(out: &mut dyn Write, record: &Record, json: bool) -> Result<(), Error> {
    let written = if json {
        let value = json!({
            "file": record.file,
            "offset": record.offset,
            "payload": String::from_utf8_lossy(&record.payload),
        });
        writeln!(out, "{value}")
    } else {
        out.write_all(&record.payload).and_then(|()| out.write_all(b"\n"))
    };
    written.and_then(|()| out.flush()).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write stdout")
            .with_source(err)
    })
}

fn list(pipe: &Pipe, topic: &str, json: bool) -> Result<(), Error> {
    let files = pipe.list_files(topic)?;
    if json {
        return emit_json(&json!(files));
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for file in files {
        writeln!(out, "{file}").map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write stdout")
                .with_source(err)
        })?;
    }
    Ok(())
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let json = serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}

fn add_unavailable_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Unavailable || err.hint().is_some() {
        return err;
    }
    err.with_hint("The cluster may be failing over; retry later or raise retry.budget_ms.")
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
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Unavailable => "cluster unavailable".to_string(),
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
    if let Some(exception) = err.exception() {
        inner.insert("exception".to_string(), json!(exception));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
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
    if let Some(exception) = err.exception() {
        lines.push(format!("exception: {exception}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    for cause in error_causes(err) {
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
