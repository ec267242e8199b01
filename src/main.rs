//! kvir: encode, dump and search key-value IR streams.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as JsonValue};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use kvir::ir_stream::{protocol, Deserializer, Serializer};
use kvir::search::{
    Expression, FilterOperation, Literal, LiteralType, LiteralTypeSet, ProjectionCallback,
    QueryConfig, QueryHandler,
};
use kvir::{EightByteEncoding, FourByteEncoding, KeyValuePairLogEvent, NodeId, VariableEncoding};

#[derive(Parser)]
#[command(name = "kvir")]
#[command(about = "Encode, dump and search key-value IR streams")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG
    /// takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file of JSON objects, one per line, into an IR stream
    Encode {
        /// Input JSON lines file
        input: PathBuf,

        /// Output IR stream
        output: PathBuf,

        /// Use four-byte variable encoding instead of eight-byte
        #[arg(long)]
        four_byte: bool,

        /// UTC offset in seconds recorded ahead of the first event
        #[arg(long)]
        utc_offset: Option<i64>,
    },
    /// Print every log event of an IR stream as a JSON line
    Dump {
        /// Input IR stream
        input: PathBuf,
    },
    /// Print the log events of an IR stream that match all filters
    Search {
        /// Input IR stream
        input: PathBuf,

        /// Filter such as `a.*.b==5`, `@ts>=100` or `msg exists`; repeatable
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        /// Report the node ids a key resolves to; repeatable
        #[arg(short, long = "projection")]
        projections: Vec<String>,

        /// Match string patterns case-insensitively
        #[arg(short = 'i', long)]
        ignore_case: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("kvir={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn encode_lines<E: VariableEncoding>(
    input: &Path,
    output: &Path,
    utc_offset: Option<i64>,
) -> Result<()> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("failed to create {}", output.display()))?,
    );

    let mut serializer = Serializer::<E>::create()?;
    if let Some(utc_offset) = utc_offset {
        serializer.change_utc_offset(utc_offset);
    }

    let empty = Map::new();
    let mut num_events = 0usize;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let object = match serde_json::from_str::<JsonValue>(&line)
            .with_context(|| format!("line {}: invalid JSON", idx + 1))?
        {
            JsonValue::Object(object) => object,
            other => bail!("line {}: expected a JSON object, got {}", idx + 1, other),
        };
        serializer
            .serialize_json_object(&empty, &object)
            .with_context(|| format!("line {}: failed to serialize", idx + 1))?;
        writer.write_all(serializer.ir_buf_view())?;
        serializer.clear_ir_buf();
        num_events += 1;
    }
    writer.write_all(&[protocol::EOF])?;
    writer.flush()?;

    tracing::info!(
        "Encoded {} log event(s) into {}",
        num_events,
        output.display()
    );
    Ok(())
}

fn event_to_json(event: &KeyValuePairLogEvent) -> Result<JsonValue> {
    let (auto_gen, user_gen) = event.serialize_to_json()?;
    Ok(serde_json::json!({
        "auto_generated": auto_gen,
        "user_generated": user_gen,
    }))
}

fn run_dump(input: &Path) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?,
    );
    let mut deserializer = Deserializer::create(&mut reader)?;
    tracing::info!(
        "Stream uses {} encoding, metadata {:?}",
        deserializer.encoding(),
        deserializer.metadata()
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    while let Some(event) = deserializer.deserialize_to_next_log_event(&mut reader)? {
        writeln!(out, "{}", event_to_json(&event)?)?;
    }
    Ok(())
}

/// Parses an operand the way a user would type it on the command line.
fn parse_literal(text: &str) -> Literal {
    let text = text.trim();
    if let Some(quoted) = text
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return Literal::String(quoted.to_string());
    }
    if let Ok(v) = text.parse::<i64>() {
        return Literal::Integer(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return Literal::Float(v);
    }
    match text {
        "true" => Literal::Boolean(true),
        "false" => Literal::Boolean(false),
        _ => Literal::String(text.to_string()),
    }
}

fn parse_filter_arg(arg: &str) -> Result<Expression> {
    let trimmed = arg.trim();

    // The first operator splits the column from the operand, so the operand
    // may itself contain operators. Two-character operators are tried first
    // at each position so `<=` isn't read as `<`.
    const OPERATORS: [(&str, FilterOperation); 6] = [
        ("==", FilterOperation::Eq),
        ("!=", FilterOperation::Neq),
        ("<=", FilterOperation::Lte),
        (">=", FilterOperation::Gte),
        ("<", FilterOperation::Lt),
        (">", FilterOperation::Gt),
    ];
    for (idx, _) in trimmed.char_indices() {
        let rest = &trimmed[idx..];
        if let Some((token, operation)) = OPERATORS
            .iter()
            .find(|(token, _)| rest.starts_with(token))
        {
            let (column, operand) = (&trimmed[..idx], &rest[token.len()..]);
            let expression =
                Expression::filter(column.trim(), *operation, Some(parse_literal(operand)))?;
            return Ok(expression);
        }
    }

    for (suffix, operation) in [
        (" not exists", FilterOperation::Nexists),
        (" exists", FilterOperation::Exists),
    ] {
        if let Some(column) = trimmed.strip_suffix(suffix) {
            return Ok(Expression::filter(column.trim(), operation, None)?);
        }
    }
    bail!("can't parse filter '{}'", arg)
}

fn run_search(
    input: &Path,
    filters: &[String],
    projections: Vec<String>,
    ignore_case: bool,
) -> Result<()> {
    let expression = match filters.len() {
        0 => None,
        1 => Some(parse_filter_arg(&filters[0])?),
        _ => Some(Expression::And(
            filters
                .iter()
                .map(|f| parse_filter_arg(f))
                .collect::<Result<Vec<_>>>()?,
        )),
    };

    let all_types: LiteralTypeSet = [
        LiteralType::Integer,
        LiteralType::Float,
        LiteralType::VarString,
        LiteralType::ClpString,
        LiteralType::Boolean,
        LiteralType::Array,
        LiteralType::Null,
    ]
    .into_iter()
    .collect();
    let projections = projections
        .into_iter()
        .map(|key| (key, all_types))
        .collect();
    let callback: ProjectionCallback = Box::new(
        |is_auto_generated: bool, node_id: NodeId, key: &str| -> anyhow::Result<()> {
            let namespace = if is_auto_generated { "auto" } else { "user" };
            eprintln!("projection {key} -> {namespace} node {node_id}");
            Ok(())
        },
    );
    let config = QueryConfig {
        case_sensitive_match: !ignore_case,
    };
    let handler = QueryHandler::create(expression, projections, config, Some(callback))?;

    let mut reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?,
    );
    let mut deserializer = Deserializer::create_with_handler(&mut reader, handler)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut num_matches = 0usize;
    while let Some(event) = deserializer.deserialize_to_next_matching_log_event(&mut reader)? {
        writeln!(out, "{}", event_to_json(&event)?)?;
        num_matches += 1;
    }
    tracing::info!("{} matching log event(s)", num_matches);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Encode {
            input,
            output,
            four_byte,
            utc_offset,
        } => {
            if four_byte {
                encode_lines::<FourByteEncoding>(&input, &output, utc_offset)
            } else {
                encode_lines::<EightByteEncoding>(&input, &output, utc_offset)
            }
        }
        Commands::Dump { input } => run_dump(&input),
        Commands::Search {
            input,
            filters,
            projections,
            ignore_case,
        } => run_search(&input, &filters, projections, ignore_case),
    }
}
