//! # scribe
//!
//! Command-line front end for the transcript pipeline.
//!
//! - `scribe replay` feeds a recorded chunk log (one JSON chunk per line)
//!   through the pipeline as if a provider were streaming it.
//! - `scribe show` prints a chat's stored transcript in order.
//! - `scribe import` loads a client-held history into a turn.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use scribe_core::{ChatId, OwnerId, StreamChunk, TurnStatus};
use scribe_pipeline::{SqliteTranscriptStore, TurnPipeline, TurnRequest};
use scribe_settings::ScribeSettings;
use scribe_store::{BeginTurn, ConnectionConfig, ImportMessage, MessageRow, TranscriptDb};
use serde_json::Value;
use tracing::{info, warn};

/// scribe: persist provider streams as ordered chat transcripts.
#[derive(Parser, Debug)]
#[command(name = "scribe", about = "Persist provider streams as ordered chat transcripts")]
struct Cli {
    /// Database path (overrides the configured one).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSONL chunk log as one turn.
    Replay {
        /// Chat to append the turn to.
        #[arg(long)]
        chat: String,
        /// Owner recorded if the chat is new.
        #[arg(long, default_value = "local")]
        owner: String,
        /// User prompt that opened the turn.
        #[arg(long)]
        prompt: Option<String>,
        /// File with one JSON chunk per line.
        events: PathBuf,
    },
    /// Print a chat's transcript.
    Show {
        /// Chat to print.
        #[arg(long)]
        chat: String,
    },
    /// Import a JSON array of history entries.
    Import {
        /// Chat to import into.
        #[arg(long)]
        chat: String,
        /// Existing turn to import into. A new turn is opened when omitted.
        #[arg(long)]
        turn: Option<i64>,
        /// Owner recorded if the chat is new.
        #[arg(long, default_value = "local")]
        owner: String,
        /// File holding the history array.
        history: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = scribe_settings::load_settings().context("failed to load settings")?;
    if let Some(path) = cli.db {
        settings.database.path = path;
    }
    scribe_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let db = Arc::new(open_db(&settings)?);

    match cli.command {
        Command::Replay {
            chat,
            owner,
            prompt,
            events,
        } => replay(db, &settings, chat, owner, prompt, &events).await,
        Command::Show { chat } => show(&db, &ChatId::from_raw(chat)),
        Command::Import {
            chat,
            turn,
            owner,
            history,
        } => import(&db, &settings, &ChatId::from_raw(chat), turn, &OwnerId::from(owner.as_str()), &history),
    }
}

fn open_db(settings: &ScribeSettings) -> Result<TranscriptDb> {
    let path = &settings.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let config = ConnectionConfig {
        pool_size: settings.database.pool_size,
        busy_timeout_ms: settings.database.busy_timeout_ms,
    };
    TranscriptDb::open(path, &config).with_context(|| format!("failed to open database at {}", path.display()))
}

async fn replay(
    db: Arc<TranscriptDb>,
    settings: &ScribeSettings,
    chat: String,
    owner: String,
    prompt: Option<String>,
    events: &Path,
) -> Result<()> {
    let raw = std::fs::read_to_string(events).with_context(|| format!("failed to read {}", events.display()))?;
    let chunks = parse_events(&raw);
    info!(events = chunks.len(), file = %events.display(), "replaying chunk log");

    let store = Arc::new(SqliteTranscriptStore::new(db));
    let pipeline = TurnPipeline::new(store, settings.pipeline.clone());
    let request = TurnRequest {
        chat_id: ChatId::from_raw(chat),
        owner: OwnerId::from(owner.as_str()),
        prompt,
    };

    let (tee, handle) = pipeline
        .start(request, futures::stream::iter(chunks))
        .await
        .context("failed to start turn")?;
    let mut tee = std::pin::pin!(tee);
    while let Some(item) = tee.next().await {
        if let Err(err) = item {
            warn!(error = %err, "stream error");
        }
    }

    let outcome = handle.finished().await.context("turn did not finish")?;
    println!("{}", outcome.final_text);
    println!("turn {} {}", outcome.turn_id, outcome.turn_status);
    for error in &outcome.errors {
        eprintln!("error: {error}");
    }
    if outcome.turn_status == TurnStatus::Error {
        bail!("turn {} ended in error", outcome.turn_id);
    }
    Ok(())
}

/// One item per non-blank line. Lines that are not JSON become stream errors.
fn parse_events(raw: &str) -> Vec<std::result::Result<StreamChunk, String>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<Value>(line)
                .map(StreamChunk::from_value)
                .map_err(|e| format!("line {}: {e}", n + 1))
        })
        .collect()
}

fn show(db: &TranscriptDb, chat_id: &ChatId) -> Result<()> {
    let Some(chat) = db.get_chat(chat_id)? else {
        bail!("chat {chat_id} not found");
    };
    if let Some(title) = &chat.title {
        println!("# {title}");
    }
    for turn in db.list_turns(chat_id)? {
        println!("turn {} [{}]", turn.turn_id, turn.status);
        for error in &turn.errors {
            println!("  ! {error}");
        }
    }
    for row in db.list_messages(chat_id)? {
        println!("{}", render_row(&row));
    }
    Ok(())
}

fn render_row(row: &MessageRow) -> String {
    let head = format!("{}.{} {} ({})", row.turn_id, row.message_order, row.role, row.status);
    if let Some(tool) = &row.tool_name {
        let args = row.function_call.as_ref().map(Value::to_string).unwrap_or_default();
        let result = row
            .tool_result
            .as_ref()
            .map_or_else(|| "…".to_owned(), Value::to_string);
        return format!("{head} {tool}({args}) -> {result}");
    }
    let text = row.content.as_ref().map(|c| c.plain_text()).unwrap_or_default();
    format!("{head}: {text}")
}

fn import(
    db: &TranscriptDb,
    settings: &ScribeSettings,
    chat_id: &ChatId,
    turn: Option<i64>,
    owner: &OwnerId,
    history: &Path,
) -> Result<()> {
    let raw = std::fs::read_to_string(history).with_context(|| format!("failed to read {}", history.display()))?;
    let messages: Vec<ImportMessage> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a history array", history.display()))?;

    let first_order = settings.pipeline.first_message_order;
    let (turn_id, opened) = match turn {
        Some(turn_id) => (turn_id, false),
        None => {
            let start = db.begin_turn(&BeginTurn {
                chat_id,
                owner,
                prompt: None,
                first_message_order: first_order,
            })?;
            (start.turn.turn_id, true)
        }
    };

    let report = db.import_history(chat_id, turn_id, &messages, first_order)?;
    if opened {
        let _ = db.complete_turn(chat_id, turn_id, TurnStatus::Complete, 0)?;
    }
    println!(
        "turn {turn_id}: {} inserted, {} merged, {} skipped",
        report.inserted, report.merged, report.skipped
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
