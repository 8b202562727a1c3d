use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Instant, SystemTime};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Span field naming the chat turn a span belongs to.
pub const TURN_ID: &str = "turn.id";
/// Span field naming the chat session a span belongs to.
pub const SESSION_ID: &str = "session.id";

/// Turns kept before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 256;

/// Fields inherited by child spans unless they set their own.
const CONTEXT_KEYS: [&str; 2] = [TURN_ID, SESSION_ID];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error { message: String },
}

/// One closed span.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_unix_nanos: u64,
    pub duration_ms: f64,
    pub attributes: HashMap<String, Value>,
    pub status: SpanStatus,
}

/// Every span captured for one chat turn, ordered by start time.
#[derive(Debug, Clone, Serialize)]
pub struct TurnTrace {
    pub turn_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub spans: Vec<SpanRecord>,
}

impl TurnTrace {
    pub fn span(&self, name: &str) -> Option<&SpanRecord> {
        self.spans.iter().find(|s| s.name == name)
    }

    pub fn has_errors(&self) -> bool {
        self.spans.iter().any(|s| matches!(s.status, SpanStatus::Error { .. }))
    }
}

#[derive(Debug, Default)]
struct Turns {
    by_id: HashMap<String, TurnTrace>,
    order: VecDeque<String>,
}

/// Bounded, shared storage of turn traces.
#[derive(Debug)]
pub struct TurnTraceStore {
    turns: RwLock<Turns>,
    capacity: usize,
}

impl Default for TurnTraceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTraceStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { turns: RwLock::new(Turns::default()), capacity: capacity.max(1) }
    }

    /// Returns the trace of `turn_id` with spans sorted by start time.
    pub fn get(&self, turn_id: &str) -> Option<TurnTrace> {
        let turns = self.turns.read().unwrap_or_else(PoisonError::into_inner);
        let mut trace = turns.by_id.get(turn_id).cloned()?;
        trace.spans.sort_by_key(|s| s.start_unix_nanos);
        Some(trace)
    }

    /// Turn ids recorded for a session, oldest first.
    pub fn session_turns(&self, session_id: &str) -> Vec<String> {
        let turns = self.turns.read().unwrap_or_else(PoisonError::into_inner);
        turns
            .order
            .iter()
            .filter(|id| {
                turns.by_id.get(*id).and_then(|t| t.session_id.as_deref()) == Some(session_id)
            })
            .cloned()
            .collect()
    }

    /// Drops every turn recorded for a session.
    pub fn forget_session(&self, session_id: &str) {
        let mut turns = self.turns.write().unwrap_or_else(PoisonError::into_inner);
        let Turns { by_id, order } = &mut *turns;
        by_id.retain(|_, t| t.session_id.as_deref() != Some(session_id));
        order.retain(|id| by_id.contains_key(id));
    }

    pub fn len(&self) -> usize {
        self.turns.read().unwrap_or_else(PoisonError::into_inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, turn_id: String, session_id: Option<String>, span: SpanRecord) {
        let mut turns = self.turns.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(trace) = turns.by_id.get_mut(&turn_id) {
            if trace.session_id.is_none() {
                trace.session_id = session_id;
            }
            trace.spans.push(span);
            return;
        }

        while turns.order.len() >= self.capacity {
            match turns.order.pop_front() {
                Some(oldest) => {
                    turns.by_id.remove(&oldest);
                }
                None => break,
            }
        }
        turns.order.push_back(turn_id.clone());
        turns.by_id.insert(turn_id.clone(), TurnTrace { turn_id, session_id, spans: vec![span] });
    }
}

/// A tracing layer that copies spans tagged with [`TURN_ID`] into a [`TurnTraceStore`].
pub struct TurnTraceLayer {
    store: Arc<TurnTraceStore>,
}

impl TurnTraceLayer {
    pub fn new(store: Arc<TurnTraceStore>) -> Self {
        Self { store }
    }
}

struct SpanState {
    started: Instant,
    start_unix_nanos: u64,
    fields: HashMap<String, Value>,
    error: Option<String>,
}

impl<S> Layer<S> for TurnTraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };

        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        let mut fields = visitor.0;

        if let Some(parent) = span.parent() {
            if let Some(state) = parent.extensions().get::<SpanState>() {
                for key in CONTEXT_KEYS {
                    if !fields.contains_key(key) {
                        if let Some(value) = state.fields.get(key) {
                            fields.insert(key.to_string(), value.clone());
                        }
                    }
                }
            }
        }

        let start_unix_nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        span.extensions_mut().insert(SpanState {
            started: Instant::now(),
            start_unix_nanos,
            fields,
            error: None,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(state) = extensions.get_mut::<SpanState>() {
            let mut visitor = JsonVisitor::default();
            values.record(&mut visitor);
            state.fields.extend(visitor.0);
        }
    }

    // An ERROR event inside a span marks that span failed.
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }
        let Some(span) = ctx.event_span(event) else { return };

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let message = match visitor.0.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => event.metadata().name().to_string(),
        };

        let mut extensions = span.extensions_mut();
        if let Some(state) = extensions.get_mut::<SpanState>() {
            state.error.get_or_insert(message);
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else { return };
        let extensions = span.extensions();
        let Some(state) = extensions.get::<SpanState>() else { return };

        let Some(turn_id) = string_field(&state.fields, TURN_ID) else { return };
        let session_id = string_field(&state.fields, SESSION_ID);

        let record = SpanRecord {
            span_id: format!("{:016x}", id.into_u64()),
            parent_span_id: span.parent().map(|p| format!("{:016x}", p.id().into_u64())),
            name: span.metadata().name().to_string(),
            start_unix_nanos: state.start_unix_nanos,
            duration_ms: state.started.elapsed().as_secs_f64() * 1000.0,
            attributes: state.fields.clone(),
            status: match &state.error {
                Some(message) => SpanStatus::Error { message: message.clone() },
                None => SpanStatus::Ok,
            },
        };
        self.store.record(turn_id, session_id, record);
    }
}

fn string_field(fields: &HashMap<String, Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Default)]
struct JsonVisitor(HashMap<String, Value>);

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{error, info_span};
    use tracing_subscriber::layer::SubscriberExt;

    fn capture<F: FnOnce()>(store: &Arc<TurnTraceStore>, f: F) {
        let subscriber = tracing_subscriber::registry().with(TurnTraceLayer::new(store.clone()));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn child_spans_inherit_turn_and_session() {
        let store = Arc::new(TurnTraceStore::new());
        capture(&store, || {
            let turn = info_span!("chat.turn", turn.id = "t-1", session.id = "s-1");
            let _turn = turn.enter();
            let _embed = info_span!("rag.embed", provider = "azure").entered();
        });

        let trace = store.get("t-1").expect("turn captured");
        assert_eq!(trace.session_id.as_deref(), Some("s-1"));
        assert_eq!(trace.spans.len(), 2);
        let embed = trace.span("rag.embed").expect("child captured");
        let turn = trace.span("chat.turn").expect("root captured");
        assert_eq!(embed.parent_span_id.as_deref(), Some(turn.span_id.as_str()));
        assert_eq!(embed.attributes.get("provider"), Some(&Value::String("azure".into())));
        assert!(!trace.has_errors());
    }

    #[test]
    fn spans_without_turn_are_ignored() {
        let store = Arc::new(TurnTraceStore::new());
        capture(&store, || {
            let _span = info_span!("ingest.batch", index = 1u64).entered();
        });
        assert!(store.is_empty());
    }

    #[test]
    fn error_event_marks_span_failed() {
        let store = Arc::new(TurnTraceStore::new());
        capture(&store, || {
            let _turn = info_span!("chat.turn", turn.id = "t-2").entered();
            let _complete = info_span!("rag.complete").entered();
            error!("upstream timed out");
        });

        let trace = store.get("t-2").expect("turn captured");
        assert!(trace.has_errors());
        assert_eq!(
            trace.span("rag.complete").map(|s| s.status.clone()),
            Some(SpanStatus::Error { message: "upstream timed out".into() })
        );
        assert_eq!(trace.span("chat.turn").map(|s| s.status.clone()), Some(SpanStatus::Ok));
    }

    #[test]
    fn recorded_turn_id_is_picked_up() {
        let store = Arc::new(TurnTraceStore::new());
        capture(&store, || {
            let span = info_span!("chat.turn", turn.id = tracing::field::Empty);
            span.record("turn.id", "late");
        });
        assert!(store.get("late").is_some());
    }

    #[test]
    fn oldest_turns_are_evicted() {
        let store = Arc::new(TurnTraceStore::with_capacity(2));
        capture(&store, || {
            for i in 0..3 {
                let _span = info_span!("chat.turn", turn.id = %format!("t{i}"), session.id = "s").entered();
            }
        });
        assert_eq!(store.len(), 2);
        assert!(store.get("t0").is_none());
        assert_eq!(store.session_turns("s"), vec!["t1".to_string(), "t2".to_string()]);

        store.forget_session("s");
        assert!(store.is_empty());
        assert!(store.session_turns("s").is_empty());
    }
}
