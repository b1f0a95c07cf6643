//! End-to-end tests: provider stream in, transcript rows out.

#![allow(missing_docs, unused_results)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rand::Rng;
use scribe_core::{ChatId, MessageContent, MessageStatus, OwnerId, Role, StreamChunk, TurnStatus, Usage};
use scribe_pipeline::{SqliteTranscriptStore, TranscriptStore, TurnOutcome, TurnPipeline, TurnRequest};
use scribe_settings::PipelineSettings;
use scribe_store::{MessageRow, Result as StoreResult, StoreError, ToolPatch, ToolWrite, TranscriptDb, TurnStart};
use serde_json::{Value, json};

// ── harness ─────────────────────────────────────────────────────────

/// Delegates to SQLite after a random delay; can fail the first N
/// non-tool inserts.
struct JitterStore {
    inner: SqliteTranscriptStore,
    max_delay_ms: u64,
    failing_inserts: AtomicUsize,
}

impl JitterStore {
    fn new(db: Arc<TranscriptDb>, max_delay_ms: u64) -> Self {
        Self {
            inner: SqliteTranscriptStore::new(db),
            max_delay_ms,
            failing_inserts: AtomicUsize::new(0),
        }
    }

    async fn jitter(&self) {
        if self.max_delay_ms == 0 {
            return;
        }
        let delay = rand::rng().random_range(0..=self.max_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[async_trait]
impl TranscriptStore for JitterStore {
    async fn begin_turn(&self, request: &TurnRequest, first_message_order: i64) -> StoreResult<TurnStart> {
        self.inner.begin_turn(request, first_message_order).await
    }

    async fn insert_message(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        role: Role,
        content: Option<MessageContent>,
        message_order: i64,
        status: MessageStatus,
    ) -> StoreResult<MessageRow> {
        self.jitter().await;
        let remaining = self.failing_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Internal("disk unavailable".into()));
        }
        self.inner
            .insert_message(chat_id, turn_id, role, content, message_order, status)
            .await
    }

    async fn update_message(
        &self,
        chat_id: &ChatId,
        message_id: i64,
        content: MessageContent,
        status: Option<MessageStatus>,
    ) -> StoreResult<()> {
        self.jitter().await;
        self.inner.update_message(chat_id, message_id, content, status).await
    }

    async fn upsert_tool_message(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        provider_id: Option<String>,
        claim: Option<i64>,
        patch: ToolPatch,
        message_order: i64,
    ) -> StoreResult<ToolWrite> {
        self.jitter().await;
        self.inner
            .upsert_tool_message(chat_id, turn_id, provider_id, claim, patch, message_order)
            .await
    }

    async fn merge_tool_message(
        &self,
        chat_id: &ChatId,
        message_id: i64,
        turn_id: i64,
        patch: ToolPatch,
    ) -> StoreResult<ToolWrite> {
        self.jitter().await;
        self.inner.merge_tool_message(chat_id, message_id, turn_id, patch).await
    }

    async fn record_usage(&self, chat_id: &ChatId, turn_id: i64, usage: Usage) -> StoreResult<()> {
        self.jitter().await;
        self.inner.record_usage(chat_id, turn_id, usage).await
    }

    async fn record_turn_error(&self, chat_id: &ChatId, turn_id: i64, error: String, needs_review: bool) -> StoreResult<()> {
        self.inner.record_turn_error(chat_id, turn_id, error, needs_review).await
    }

    async fn complete_turn(&self, chat_id: &ChatId, turn_id: i64, status: TurnStatus, latency_ms: i64) -> StoreResult<bool> {
        self.inner.complete_turn(chat_id, turn_id, status, latency_ms).await
    }

    async fn fail_turn(&self, chat_id: &ChatId, turn_id: i64, error: String) -> StoreResult<bool> {
        self.inner.fail_turn(chat_id, turn_id, error).await
    }

    async fn set_title_if_absent(&self, chat_id: &ChatId, title: String) -> StoreResult<bool> {
        self.inner.set_title_if_absent(chat_id, title).await
    }
}

fn chat() -> ChatId {
    ChatId::from_raw("chat-1")
}

fn request(prompt: Option<&str>) -> TurnRequest {
    TurnRequest {
        chat_id: chat(),
        owner: OwnerId::from("alice"),
        prompt: prompt.map(String::from),
    }
}

fn chunks(values: Vec<Value>) -> Vec<StreamChunk> {
    values.into_iter().map(StreamChunk::from_value).collect()
}

fn source(items: Vec<StreamChunk>) -> impl Stream<Item = Result<StreamChunk, String>> {
    stream! {
        for item in items {
            tokio::task::yield_now().await;
            yield Ok(item);
        }
    }
}

/// Run one turn to completion; returns what the caller saw and the outcome.
async fn run_turn<S>(store: Arc<dyn TranscriptStore>, request: TurnRequest, source: S) -> (Vec<Result<StreamChunk, String>>, TurnOutcome)
where
    S: Stream<Item = Result<StreamChunk, String>>,
{
    let pipeline = TurnPipeline::new(store, PipelineSettings::default());
    let (tee, handle) = pipeline.start(request, source).await.unwrap();
    let seen: Vec<_> = tee.collect().await;
    let outcome = handle.finished().await.unwrap();
    (seen, outcome)
}

fn sqlite(db: &Arc<TranscriptDb>) -> Arc<dyn TranscriptStore> {
    Arc::new(SqliteTranscriptStore::new(Arc::clone(db)))
}

fn tool_call(id: &str, input: &str) -> Value {
    json!({"type": "tool-call", "toolCallId": id, "toolName": "lookup", "input": input})
}

// ── scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_scenario() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let items = chunks(vec![
        json!({"type": "text-start", "id": "a"}),
        json!({"type": "text-delta", "id": "a", "delta": "Hello "}),
        json!({"type": "text-delta", "id": "a", "delta": "world"}),
        json!({"type": "text-end", "id": "a"}),
        tool_call("t1", "{\"q\":1}"),
        json!({"type": "tool-result", "toolCallId": "t1", "toolName": "lookup", "output": {"type": "text", "value": "42"}}),
        json!({"type": "finish", "usage": {"inputTokens": 10, "outputTokens": 5, "totalTokens": 15}}),
    ]);

    let (seen, outcome) = run_turn(sqlite(&db), request(None), source(items.clone())).await;

    let seen: Vec<StreamChunk> = seen.into_iter().map(Result::unwrap).collect();
    assert_eq!(seen, items, "the caller sees the provider stream unchanged");
    assert_eq!(outcome.turn_status, TurnStatus::Complete);
    assert_eq!(outcome.final_text, "Hello world");

    let rows = db.list_messages(&chat()).unwrap();
    assert_eq!(rows.len(), 2);
    let assistant = &rows[0];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.content, Some(MessageContent::from("Hello world")));
    assert_eq!(assistant.status, MessageStatus::Complete);

    let tool = &rows[1];
    assert_eq!(tool.role, Role::Tool);
    assert_eq!(tool.provider_id.as_deref(), Some("t1"));
    assert_eq!(tool.function_call, Some(json!({"q": 1})));
    assert_eq!(tool.tool_result, Some(json!("42")));
    assert_eq!(tool.status, MessageStatus::Complete);

    let usage = db.token_usage(&chat(), outcome.turn_id).unwrap().unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens, usage.total_tokens), (10, 5, 15));

    let turn = db.get_turn(&chat(), outcome.turn_id).unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Complete);
    assert!(turn.completed_at.is_some());
    assert_eq!(db.get_chat(&chat()).unwrap().unwrap().title.as_deref(), Some("Hello world"));
}

#[tokio::test]
async fn replayed_tool_call_is_one_row() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let items = chunks(vec![tool_call("t1", "{\"q\":1}"), tool_call("t1", "{\"q\":1}")]);

    let (_, outcome) = run_turn(sqlite(&db), request(None), source(items)).await;

    assert_eq!(outcome.turn_status, TurnStatus::Complete);
    let rows = db.list_messages(&chat()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].function_call, Some(json!({"q": 1})));
    assert_eq!(rows[0].modified_turn_id(), Some(outcome.turn_id));
}

#[tokio::test]
async fn ordering_holds_under_jitter() {
    const N: usize = 25;
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let store: Arc<dyn TranscriptStore> = Arc::new(JitterStore::new(Arc::clone(&db), 6));
    let items = chunks((0..N).map(|i| tool_call(&format!("t{i}"), "{}")).collect());

    let (_, outcome) = run_turn(store, request(None), source(items)).await;

    assert_eq!(outcome.turn_status, TurnStatus::Complete);
    let rows = db.list_messages(&chat()).unwrap();
    let orders: Vec<i64> = rows.iter().map(|r| r.message_order).collect();
    let expected: Vec<i64> = (1..=N as i64).collect();
    assert_eq!(orders, expected);
    let providers: Vec<String> = rows.iter().map(|r| r.provider_id.clone().unwrap()).collect();
    let expected: Vec<String> = (0..N).map(|i| format!("t{i}")).collect();
    assert_eq!(providers, expected);
}

#[tokio::test]
async fn interleaved_text_and_tools_keep_their_order_under_jitter() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let store: Arc<dyn TranscriptStore> = Arc::new(JitterStore::new(Arc::clone(&db), 4));
    let items = chunks(vec![
        json!({"type": "text-delta", "id": "a", "delta": "one"}),
        tool_call("t1", "{}"),
        json!({"type": "text-delta", "id": "b", "delta": "two"}),
        tool_call("t2", "{}"),
        json!({"type": "text-delta", "id": "c", "delta": "three"}),
    ]);

    let (_, outcome) = run_turn(store, request(Some("go")), source(items)).await;

    assert_eq!(outcome.final_text, "onetwothree");
    let rows = db.list_messages(&chat()).unwrap();
    let shape: Vec<(i64, Role, String)> = rows
        .iter()
        .map(|r| {
            let label = match r.role {
                Role::Tool => r.provider_id.clone().unwrap_or_default(),
                _ => r.content.as_ref().map(MessageContent::plain_text).unwrap_or_default(),
            };
            (r.message_order, r.role, label)
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            (1, Role::User, "go".to_string()),
            (2, Role::Assistant, "one".to_string()),
            (3, Role::Tool, "t1".to_string()),
            (4, Role::Assistant, "two".to_string()),
            (5, Role::Tool, "t2".to_string()),
            (6, Role::Assistant, "three".to_string()),
        ]
    );
    assert!(rows.iter().all(|r| r.status == MessageStatus::Complete || r.role == Role::Tool));
}

#[tokio::test]
async fn newer_turn_wins_same_turn_loses() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());

    let first = chunks(vec![tool_call("t1", "{\"v\":\"A\"}"), tool_call("t1", "{\"v\":\"B\"}")]);
    let (_, turn_one) = run_turn(sqlite(&db), request(None), source(first)).await;
    let row = db.find_tool_message(&chat(), "t1").unwrap().unwrap();
    assert_eq!(row.function_call, Some(json!({"v": "A"})), "same turn must not overwrite");
    assert_eq!(row.modified_turn_id(), Some(turn_one.turn_id));

    let second = chunks(vec![tool_call("t1", "{\"v\":\"B\"}")]);
    let (_, turn_two) = run_turn(sqlite(&db), request(None), source(second)).await;
    let row = db.find_tool_message(&chat(), "t1").unwrap().unwrap();
    assert_eq!(row.function_call, Some(json!({"v": "B"})), "newer turn must overwrite");
    assert_eq!(row.modified_turn_id(), Some(turn_two.turn_id));
    assert_eq!(row.turn_id, turn_one.turn_id, "the row stays where it was created");
    assert_eq!(db.list_messages(&chat()).unwrap().len(), 1);
}

#[tokio::test]
async fn correlation_survives_interleaved_text() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let items = chunks(vec![
        tool_call("t1", "{\"q\":1}"),
        json!({"type": "text-delta", "id": "a", "delta": "while waiting"}),
        json!({"type": "tool-result", "toolCallId": "t1", "toolName": "lookup", "output": {"type": "json", "value": {"a": 42}}}),
    ]);

    let (_, outcome) = run_turn(sqlite(&db), request(None), source(items)).await;

    assert_eq!(outcome.turn_status, TurnStatus::Complete);
    let rows = db.list_messages(&chat()).unwrap();
    let tools: Vec<&MessageRow> = rows.iter().filter(|r| r.role == Role::Tool).collect();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].function_call, Some(json!({"q": 1})));
    assert_eq!(tools[0].tool_result, Some(json!({"a": 42})));

    let text: Vec<&MessageRow> = rows.iter().filter(|r| r.role == Role::Assistant).collect();
    assert_eq!(text.len(), 1);
    assert_eq!(text[0].content, Some(MessageContent::from("while waiting")));
    assert!(text[0].message_order > tools[0].message_order);
}

#[tokio::test]
async fn finish_with_nothing_to_record_is_a_noop() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let items = chunks(vec![json!({"type": "finish", "usage": {"inputTokens": 0, "outputTokens": 0, "totalTokens": 0}})]);

    let (_, outcome) = run_turn(sqlite(&db), request(None), source(items)).await;

    assert_eq!(outcome.turn_status, TurnStatus::Complete);
    assert!(db.token_usage(&chat(), outcome.turn_id).unwrap().is_none());
    assert!(db.list_messages(&chat()).unwrap().is_empty());
}

#[tokio::test]
async fn tool_error_marks_turn_but_keeps_the_row() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let items = chunks(vec![
        tool_call("t1", "{}"),
        json!({"type": "tool-result", "toolCallId": "t1", "toolName": "lookup", "output": {"type": "error-text", "value": "lookup exploded"}}),
    ]);

    let (_, outcome) = run_turn(sqlite(&db), request(None), source(items)).await;

    assert_eq!(outcome.turn_status, TurnStatus::Error);
    let turn = db.get_turn(&chat(), outcome.turn_id).unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Error);
    assert_eq!(turn.errors.len(), 1);
    assert!(turn.errors[0].contains("lookup exploded"));
    assert!(turn.needs_review);

    let row = db.find_tool_message(&chat(), "t1").unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Complete);
    assert_eq!(row.tool_result, Some(json!("lookup exploded")));
}

#[tokio::test]
async fn transport_errors_reach_the_caller_and_the_turn() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let failing = stream! {
        yield Ok(StreamChunk::TextDelta { id: "a".into(), delta: "partial".into() });
        yield Err("connection reset".to_string());
    };

    let (seen, outcome) = run_turn(sqlite(&db), request(None), failing).await;

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1], Err("connection reset".to_string()));
    assert_eq!(outcome.turn_status, TurnStatus::Error);
    assert_eq!(outcome.errors, vec!["transport error: connection reset"]);

    let rows = db.list_messages(&chat()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, Some(MessageContent::from("partial")));
    assert_eq!(rows[0].status, MessageStatus::Complete);
}

#[tokio::test]
async fn a_failed_write_does_not_stop_later_events() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let store = JitterStore::new(Arc::clone(&db), 0);
    store.failing_inserts.store(1, Ordering::SeqCst);
    let items = chunks(vec![
        json!({"type": "text-delta", "id": "a", "delta": "retried"}),
        tool_call("t1", "{}"),
        json!({"type": "text-delta", "id": "b", "delta": "kept"}),
    ]);

    let (seen, outcome) = run_turn(Arc::new(store), request(None), source(items)).await;

    assert_eq!(seen.len(), 3, "the caller never notices persistence failures");
    assert_eq!(outcome.turn_status, TurnStatus::Error);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("disk unavailable"));

    assert!(db.find_tool_message(&chat(), "t1").unwrap().is_some());
    let texts: Vec<String> = db
        .list_messages(&chat())
        .unwrap()
        .iter()
        .filter(|r| r.role == Role::Assistant)
        .filter_map(|r| r.content.as_ref().map(MessageContent::plain_text))
        .collect();
    assert!(texts.contains(&"kept".to_string()));
    let turn = db.get_turn(&chat(), outcome.turn_id).unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Error);
    assert_eq!(turn.errors.len(), 1);
}

#[tokio::test]
async fn dropping_the_stream_early_still_finalizes() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let items = chunks(vec![
        json!({"type": "text-delta", "id": "a", "delta": "first"}),
        json!({"type": "text-delta", "id": "a", "delta": " second"}),
    ]);
    let pipeline = TurnPipeline::new(sqlite(&db), PipelineSettings::default());
    let (tee, handle) = pipeline.start(request(Some("hi")), source(items)).await.unwrap();

    let mut tee = Box::pin(tee);
    let first = tee.next().await.unwrap().unwrap();
    assert_eq!(first.kind(), "text-delta");
    drop(tee);

    let outcome = handle.finished().await.unwrap();
    assert_eq!(outcome.turn_status, TurnStatus::Complete);
    assert_eq!(outcome.final_text, "first");
    let rows = db.list_messages(&chat()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].role, Role::User);
    assert_eq!(rows[1].content, Some(MessageContent::from("first")));
}

#[tokio::test]
async fn consecutive_turns_get_consecutive_numbers() {
    let db = Arc::new(TranscriptDb::in_memory().unwrap());
    let mut turns = Vec::new();
    for prompt in ["one", "two", "three"] {
        let items = chunks(vec![json!({"type": "text-delta", "id": "a", "delta": prompt})]);
        let (_, outcome) = run_turn(sqlite(&db), request(Some(prompt)), source(items)).await;
        turns.push(outcome.turn_id);
    }
    assert_eq!(turns, vec![1, 2, 3]);
    assert_eq!(db.list_messages(&chat()).unwrap().len(), 6);
    assert_eq!(db.get_chat(&chat()).unwrap().unwrap().title.as_deref(), Some("one"));
}
