//! Buffered/batched processing engine.
//!
//! Records are queued one at a time; once the queue crosses the high-water
//! mark (or the stream ends) the engine signals backpressure and drains the
//! queue into bounded packets, handing each packet to a [`PacketHandler`].
//! Exactly one drain loop runs at a time, and every queued record is released
//! exactly once, including on fatal abort.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{Continuation, EventContext, FlowControl, Middleware, StreamItem};

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_PACKET_SIZE: usize = 50;

/// Filter verdict for a dequeued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Add the record to the packet being assembled.
    Keep,
    /// Release the record immediately; it does not need a query.
    Drop,
}

/// A bounded batch of records assembled for one external round-trip.
///
/// When grouping is enabled, `groups` maps each group key to the indexes of
/// its members in `ecs`, and packet fullness is measured in distinct groups
/// rather than records.
#[derive(Default)]
pub struct Packet {
    pub ecs: Vec<(EventContext, Continuation)>,
    pub groups: HashMap<String, Vec<usize>>,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.ecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ecs.is_empty()
    }

    /// Releases every record of the packet unenriched.
    pub fn release_all(self) {
        for (ec, cont) in self.ecs {
            cont.release(ec);
        }
    }

    /// Rejects every record of the packet with the same error.
    pub fn reject_all(self, error: &Arc<anyhow::Error>) {
        for (ec, cont) in self.ecs {
            cont.reject(ec, error.clone());
        }
    }
}

/// Per-source behavior plugged into the engine.
///
/// `filter` and `group_key` drive packet assembly; `on_packet` performs the
/// batched query and must call every continuation of the packet exactly once
/// before returning, whether the query succeeded or not. An `Err` from
/// `on_packet` is fatal for the whole stream.
#[async_trait]
pub trait PacketHandler: Send {
    /// Decides whether a record joins the next packet. May mutate the record
    /// first (e.g. enrich it from a cache and drop it). A returned error is
    /// record-scoped: the record is rejected and the stream continues.
    async fn filter(&mut self, _ec: &mut EventContext) -> Result<Verdict, anyhow::Error> {
        Ok(Verdict::Keep)
    }

    async fn on_packet(&mut self, packet: Packet) -> anyhow::Result<()>;
}

/// Grouping strategy: either the value of a record field, or an arbitrary
/// key function. Records with no key stay ungrouped but still join the packet.
pub enum GroupBy {
    Field(String),
    Key(Box<dyn Fn(&EventContext) -> Option<String> + Send + Sync>),
}

impl GroupBy {
    fn key_for(&self, ec: &EventContext) -> Option<String> {
        match self {
            GroupBy::Field(field) => ec.str_field(field).map(str::to_owned),
            GroupBy::Key(f) => f(ec),
        }
    }
}

/// Engine tuning. Out-of-range values (zero sizes) fall back to defaults.
pub struct BufferOptions {
    /// High-water mark: queue length that triggers a drain.
    pub buffer_size: usize,
    /// Maximum records (or distinct groups) per packet.
    pub packet_size: usize,
    pub group_by: Option<GroupBy>,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            packet_size: DEFAULT_PACKET_SIZE,
            group_by: None,
        }
    }
}

/// The buffered processor: accepts one [`StreamItem`] at a time, queues
/// records, and drains the queue through the packet handler.
pub struct BufferedProcessor<H: PacketHandler> {
    handler: H,
    buffer: VecDeque<(EventContext, Continuation)>,
    buffer_size: usize,
    packet_size: usize,
    group_by: Option<GroupBy>,
    flow: FlowControl,
    flushing: bool,
}

impl<H: PacketHandler> BufferedProcessor<H> {
    pub fn new(handler: H, options: BufferOptions, flow: FlowControl) -> Self {
        let buffer_size = if options.buffer_size < 1 {
            DEFAULT_BUFFER_SIZE
        } else {
            options.buffer_size
        };
        let packet_size = if options.packet_size < 1 {
            DEFAULT_PACKET_SIZE
        } else {
            options.packet_size
        };

        Self {
            handler,
            buffer: VecDeque::new(),
            buffer_size,
            packet_size,
            group_by: options.group_by,
            flow,
            flushing: false,
        }
    }

    /// Feeds one item into the engine.
    ///
    /// A record is queued; when the queue rises past the high-water mark a
    /// `Saturate` signal is emitted, the queue is drained below the mark, and
    /// a matching `Drain` signal follows. The flush item drains the queue to
    /// empty and acknowledges once every record has been released.
    ///
    /// On a fatal packet error every record still queued is rejected with
    /// that error before it is propagated, so no continuation is ever lost.
    pub async fn process(&mut self, item: StreamItem) -> anyhow::Result<()> {
        match item {
            StreamItem::Flush(ack) => {
                self.flushing = true;
                if let Err(err) = self.drain_buffer().await {
                    return Err(self.abort(err));
                }
                let _ = ack.send(());
                Ok(())
            }
            StreamItem::Ec(ec, cont) => {
                self.buffer.push_back((ec, cont));

                if self.buffer.len() > self.buffer_size {
                    self.flow.saturate();
                    let drained = self.drain_buffer().await;
                    self.flow.drain();

                    if let Err(err) = drained {
                        return Err(self.abort(err));
                    }
                }
                Ok(())
            }
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Processes packets until the queue drops below the high-water mark, or,
    /// once the stream has ended, until the queue is empty.
    async fn drain_buffer(&mut self) -> anyhow::Result<()> {
        while self.buffer.len() >= self.buffer_size || (self.flushing && !self.buffer.is_empty()) {
            let packet = self.next_packet().await;

            if packet.is_empty() {
                // nothing extractable right now; yield instead of spinning
                tokio::task::yield_now().await;
                continue;
            }

            debug!(records = packet.len(), "processing packet");
            self.handler.on_packet(packet).await?;
        }
        Ok(())
    }

    /// Assembles the next packet by pulling queued records in FIFO order
    /// through the filter. Returns a partial (possibly empty) packet when the
    /// queue runs out first.
    async fn next_packet(&mut self) -> Packet {
        let mut packet = Packet::default();

        while !self.packet_full(&packet) {
            let Some((mut ec, cont)) = self.buffer.pop_front() else {
                break;
            };

            match self.handler.filter(&mut ec).await {
                Ok(Verdict::Keep) => {}
                Ok(Verdict::Drop) => {
                    cont.release(ec);
                    continue;
                }
                Err(err) => {
                    cont.reject(ec, Arc::new(err));
                    continue;
                }
            }

            if let Some(group_by) = &self.group_by {
                if let Some(key) = group_by.key_for(&ec) {
                    packet.groups.entry(key).or_default().push(packet.ecs.len());
                }
            }
            packet.ecs.push((ec, cont));
        }

        packet
    }

    fn packet_full(&self, packet: &Packet) -> bool {
        match self.group_by {
            Some(_) => packet.groups.len() >= self.packet_size,
            None => packet.ecs.len() >= self.packet_size,
        }
    }

    /// Rejects everything still queued with the fatal error, then returns it.
    fn abort(&mut self, err: anyhow::Error) -> anyhow::Error {
        let shared = Arc::new(err);
        while let Some((ec, cont)) = self.buffer.pop_front() {
            cont.reject(ec, shared.clone());
        }
        anyhow::anyhow!(shared)
    }
}

#[async_trait]
impl<H: PacketHandler> Middleware for BufferedProcessor<H> {
    async fn process(&mut self, item: StreamItem) -> anyhow::Result<()> {
        BufferedProcessor::process(self, item).await
    }
}
