//! Core stream primitives shared by every enrichment middleware.
//!
//! An [`EventContext`] is one normalized access-log record flowing through the
//! pipeline. Each record travels paired with a [`Continuation`], a one-shot
//! release callback; ownership makes the exactly-once release guarantee a
//! compile-time property.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

/// One event context (EC): an open-ended field/value mapping describing a
/// single logged access. Enrichment adds fields, it never renames or removes
/// existing ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventContext(Map<String, Value>);

impl EventContext {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn has(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Sets a field only if the record does not carry it yet. Enrichment
    /// fills gaps, it never overwrites what the log already provided.
    pub fn set_if_absent(&mut self, field: &str, value: impl Into<Value>) {
        if !self.0.contains_key(field) {
            self.0.insert(field.to_owned(), value.into());
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for EventContext {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Error attached to a rejected record. Shared because a single packet
/// failure rejects every record of the packet.
pub type ReleaseError = Arc<anyhow::Error>;

/// A record leaving a middleware: the (possibly enriched) EC and, when the
/// record was aborted from normal processing, the error that did it.
#[derive(Debug)]
pub struct Released {
    pub ec: EventContext,
    pub error: Option<ReleaseError>,
}

/// One-shot release callback paired 1:1 with a record.
///
/// Consuming `self` in [`release`](Self::release) and
/// [`reject`](Self::reject) makes double release unrepresentable; dropping a
/// `Continuation` without calling it is the remaining defect to watch for.
pub struct Continuation(Box<dyn FnOnce(Released) + Send>);

impl Continuation {
    pub fn new(f: impl FnOnce(Released) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Signals that this middleware is done with the record.
    pub fn release(self, ec: EventContext) {
        (self.0)(Released { ec, error: None })
    }

    /// Releases the record with an error, aborting it from further normal
    /// processing without stopping the stream.
    pub fn reject(self, ec: EventContext, error: ReleaseError) {
        (self.0)(Released {
            ec,
            error: Some(error),
        })
    }

    /// Continuation delivering the released record on a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<Released>) {
        let (tx, rx) = oneshot::channel();
        let cont = Self::new(move |released| {
            let _ = tx.send(released);
        });
        (cont, rx)
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Continuation")
    }
}

/// What a middleware receives from upstream: either one record with its
/// continuation, or the end-of-stream signal whose acknowledgement fires once
/// every buffered record has been released.
#[derive(Debug)]
pub enum StreamItem {
    Ec(EventContext, Continuation),
    Flush(oneshot::Sender<()>),
}

/// Backpressure notification emitted by a middleware towards its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// The middleware is saturated; the producer should stop sending.
    Saturate,
    /// The middleware caught up; the producer may resume.
    Drain,
}

/// Sender half for backpressure signals. A disconnected receiver is not an
/// error: a producer that does not care simply never subscribes.
#[derive(Clone)]
pub struct FlowControl {
    tx: Option<mpsc::UnboundedSender<FlowSignal>>,
}

impl FlowControl {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlowSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Flow control that notifies nobody.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn saturate(&self) {
        self.send(FlowSignal::Saturate);
    }

    pub fn drain(&self) {
        self.send(FlowSignal::Drain);
    }

    fn send(&self, signal: FlowSignal) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(signal);
        }
    }
}

/// Object-safe face of a pipeline stage: one [`StreamItem`] in, releases out
/// through the item's continuation. An `Err` is fatal for the stream.
#[async_trait::async_trait]
pub trait Middleware: Send {
    async fn process(&mut self, item: StreamItem) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_if_absent_keeps_existing_value() {
        let mut ec = EventContext::new();
        ec.set("title", "original");
        ec.set_if_absent("title", "enriched");
        ec.set_if_absent("publisher_name", "Springer");

        assert_eq!(ec.str_field("title"), Some("original"));
        assert_eq!(ec.str_field("publisher_name"), Some("Springer"));
    }

    #[test]
    fn event_context_roundtrips_as_plain_json_object() {
        let ec: EventContext =
            serde_json::from_value(json!({"doi": "10.1234/abc", "size": 42})).unwrap();
        assert_eq!(ec.str_field("doi"), Some("10.1234/abc"));

        let back = serde_json::to_value(&ec).unwrap();
        assert_eq!(back, json!({"doi": "10.1234/abc", "size": 42}));
    }

    #[tokio::test]
    async fn continuation_release_delivers_record() {
        let (cont, rx) = Continuation::channel();
        let mut ec = EventContext::new();
        ec.set("doi", "10.1234/abc");

        cont.release(ec);

        let released = rx.await.unwrap();
        assert_eq!(released.ec.str_field("doi"), Some("10.1234/abc"));
        assert!(released.error.is_none());
    }

    #[tokio::test]
    async fn continuation_reject_carries_error() {
        let (cont, rx) = Continuation::channel();
        let err = Arc::new(anyhow::anyhow!("source unreachable"));

        cont.reject(EventContext::new(), err);

        let released = rx.await.unwrap();
        assert_eq!(released.error.unwrap().to_string(), "source unreachable");
    }

    #[tokio::test]
    async fn flow_control_delivers_signals_in_order() {
        let (flow, mut rx) = FlowControl::new();
        flow.saturate();
        flow.drain();

        assert_eq!(rx.recv().await, Some(FlowSignal::Saturate));
        assert_eq!(rx.recv().await, Some(FlowSignal::Drain));
    }
}
