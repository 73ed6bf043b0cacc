//! Correlated request/response and fire-and-forget messaging over one duplex
//! text-framed link, with trailing-edge batching.
//!
//! A frame is a JSON array of payloads; the receiving side iterates and
//! dispatches each one. Correlation ids are `{c|s}_{busId}_{seq}` so the two
//! ends can never collide.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use eyre::Result;
use serde_json::{json, Value};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    errors::Error,
    metrics::BUS_REQUESTS,
    protocol::{BusMessage, CloseCode, Payload},
};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(0);

/// One side of a duplex text-framed connection. The server adapter wraps a
/// WebSocket; tests wrap an in-memory pipe.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, frame: String) -> Result<()>;
    async fn close(&self, code: CloseCode);
}

/// Inbound events produced by a link driver and consumed by the gateway.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(String),
    Error(String),
    Closed,
}

/// Receives everything the remote peer sends that is not a response.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle_message(&self, message: BusMessage);
    async fn handle_request(&self, message: BusMessage) -> Result<Value>;
}

#[derive(Clone, Copy, Debug)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn prefix(self) -> &'static str {
        match self {
            Self::Client => "c",
            Self::Server => "s",
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestOptions {
    /// Deadline override; the bus default applies when unset.
    pub timeout: Option<Duration>,
    pub batch: bool,
}

pub struct Bus {
    id: u64,
    side: Side,
    link: Arc<dyn Link>,
    batch_delay: Duration,
    request_timeout: Duration,
    seq: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    // Lock order is queue then batch_timer, everywhere.
    queue: Mutex<VecDeque<Payload>>,
    batch_timer: Mutex<Option<JoinHandle<()>>>,
    handler: Mutex<Option<Arc<dyn BusHandler>>>,
}

impl Bus {
    pub fn new(
        link: Arc<dyn Link>,
        side: Side,
        batch_delay: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            side,
            link,
            batch_delay,
            request_timeout,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            batch_timer: Mutex::new(None),
            handler: Mutex::new(None),
        })
    }

    pub async fn set_handler(&self, handler: Arc<dyn BusHandler>) {
        *self.handler.lock().await = Some(handler);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fire-and-forget send.
    pub async fn send(self: &Arc<Self>, message: &BusMessage, batch: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BusClosed.into());
        }

        let payload = Payload::message(serde_json::to_value(message)?);

        if batch {
            self.enqueue(payload).await
        } else {
            self.frame(&[payload]).await
        }
    }

    /// Sends a request and waits for the correlated response.
    pub async fn request(
        self: &Arc<Self>,
        message: &BusMessage,
        opts: RequestOptions,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::BusClosed.into());
        }

        let id = format!(
            "{}_{}_{}",
            self.side.prefix(),
            self.id,
            self.seq.fetch_add(1, Ordering::Relaxed)
        );

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let payload = Payload::request(serde_json::to_value(message)?, id.clone());
        let sent = if opts.batch {
            self.enqueue(payload).await
        } else {
            self.frame(&[payload]).await
        };

        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let deadline = opts.timeout.unwrap_or(self.request_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(value)) => {
                BUS_REQUESTS.with_label_values(&["ok"]).inc();
                Ok(value)
            }
            Ok(Err(_)) => {
                BUS_REQUESTS.with_label_values(&["closed"]).inc();
                Err(Error::BusClosed.into())
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                BUS_REQUESTS.with_label_values(&["timeout"]).inc();
                Err(Error::RequestTimeout.into())
            }
        }
    }

    /// Feeds one inbound frame through the bus. Payloads are dispatched in
    /// order, which is what gives the FIFO guarantee.
    pub async fn handle_frame(self: &Arc<Self>, text: &str) {
        let payloads: Vec<Payload> = match serde_json::from_str(text) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!("discarding unparseable frame: {e}");
                return;
            }
        };

        for payload in payloads {
            self.dispatch(payload).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, payload: Payload) {
        if let Some(to) = payload.response_to {
            if let Some(tx) = self.pending.lock().await.remove(&to) {
                let _result = tx.send(payload.message);
            } else {
                debug!(id = %to, "response for no pending request");
            }
            return;
        }

        let message: BusMessage = match serde_json::from_value(payload.message) {
            Ok(message) => message,
            Err(e) => {
                warn!("discarding unparseable message: {e}");
                return;
            }
        };

        let handler = self.handler.lock().await.clone();
        let Some(handler) = handler else {
            debug!(name = message.name.as_ref(), "no handler installed");
            return;
        };

        match payload.need_response {
            Some(id) => {
                let body = match handler.handle_request(message).await {
                    Ok(value) => value,
                    Err(e) => json!({ "error": e.to_string() }),
                };

                if let Err(e) = self.frame(&[Payload::response(body, id)]).await {
                    debug!("failed sending response: {e}");
                }
            }
            None => handler.handle_message(message).await,
        }
    }

    /// Rejects every pending request, cancels the batch window and detaches
    /// the handler. The link itself is closed by whoever owns it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let queue = self.queue.lock().await;
            if let Some(timer) = self.batch_timer.lock().await.take() {
                timer.abort();
            }
            drop(queue);
        }

        // Dropping the senders wakes every waiter with BusClosed.
        self.pending.lock().await.clear();
        *self.handler.lock().await = None;
    }

    /// Trailing-edge batching with an immediate first flush: an idle queue is
    /// flushed at once and the window armed; while the window is open sends
    /// accumulate; each expiry flushes what accumulated and keeps the window
    /// only if it produced work.
    async fn enqueue(self: &Arc<Self>, payload: Payload) -> Result<()> {
        let mut queue = self.queue.lock().await;
        queue.push_back(payload);

        let mut timer = self.batch_timer.lock().await;
        if timer.is_none() {
            let drained: Vec<_> = queue.drain(..).collect();
            self.frame(&drained).await?;
            *timer = Some(self.arm_batch_timer());
        }

        Ok(())
    }

    fn arm_batch_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::downgrade(self);
        let delay = self.batch_delay;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;

                let Some(bus) = Weak::upgrade(&bus) else {
                    return;
                };

                let mut queue = bus.queue.lock().await;
                if queue.is_empty() {
                    *bus.batch_timer.lock().await = None;
                    return;
                }

                let drained: Vec<_> = queue.drain(..).collect();
                if let Err(e) = bus.frame(&drained).await {
                    debug!("batch flush failed: {e}");
                    *bus.batch_timer.lock().await = None;
                    return;
                }
            }
        })
    }

    async fn frame(&self, payloads: &[Payload]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BusClosed.into());
        }

        self.link.send(serde_json::to_string(payloads)?).await
    }
}
