use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use rules_engine::Rule;
use serde::Serialize;
use tokio::{
    net::UnixListener,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use warden_core::{Event, ShutdownSender, ShutdownSignal, StatsError, StatsSink, stats::tag};

use crate::{
    EVENTS_ROUTE,
    dto::{DeliveryStats, MatchMessage},
    error::EventServerError,
};

pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Fan-out of rule matches to the connected subscribers.
///
/// Every subscriber owns a bounded queue. Sending never waits: when the queue
/// of a subscriber is full the match is dropped for that subscriber only.
/// A match is serialized once and shared by every queue.
#[derive(Clone)]
pub struct EventServer {
    inner: Arc<Inner>,
}

struct Inner {
    queue_size: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    /// Mirrors `subscribers.len()`, updated under its lock.
    subscriber_count: AtomicUsize,
    rules: RwLock<HashMap<String, RuleCounters>>,
}

impl Inner {
    fn subscribers(&self) -> SubscribersGuard<'_> {
        SubscribersGuard {
            map: self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            count: &self.subscriber_count,
        }
    }
}

/// Subscriber map lock which refreshes the subscriber count on release.
struct SubscribersGuard<'a> {
    map: MutexGuard<'a, HashMap<u64, mpsc::Sender<Arc<str>>>>,
    count: &'a AtomicUsize,
}

impl Drop for SubscribersGuard<'_> {
    fn drop(&mut self) {
        self.count.store(self.map.len(), Ordering::Release);
    }
}

#[derive(Default)]
struct RuleCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventServerStats {
    pub subscribers: usize,
    pub rules: BTreeMap<String, DeliveryStats>,
}

impl EventServer {
    pub fn new(queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue_size: queue_size.max(1),
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
                subscriber_count: AtomicUsize::new(0),
                rules: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Track delivery counters for exactly `rule_ids`.
    ///
    /// Counters of rules still present are kept.
    pub fn apply(&self, rule_ids: &[String]) {
        let mut rules = self
            .inner
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let active: HashSet<&str> = rule_ids.iter().map(String::as_str).collect();
        rules.retain(|id, _| active.contains(id.as_str()));
        for id in rule_ids {
            rules.entry(id.clone()).or_default();
        }
    }

    /// Queue a match to every subscriber.
    pub fn send_event(&self, rule: &Rule, event: &Event) -> Result<(), EventServerError> {
        if self.subscriber_count() == 0 {
            return Ok(());
        }

        let json: Arc<str> = serde_json::to_string(&MatchMessage::new(rule, event))?.into();

        let mut subscribers = self.inner.subscribers();
        let mut sent = 0;
        let mut dropped = 0;
        subscribers.map.retain(|id, tx| match tx.try_send(json.clone()) {
            Ok(()) => {
                sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::trace!("subscriber {id} is lagging, dropping match of {}", rule.id);
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("subscriber {id} disconnected");
                false
            }
        });
        drop(subscribers);

        let rules = self
            .inner
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(counters) = rules.get(&rule.id) {
            counters.sent.fetch_add(sent, Ordering::Relaxed);
            counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_size);

        self.inner.subscribers().map.insert(id, tx);

        Subscription {
            id,
            rx,
            server: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.subscribers().map.remove(&id);
    }

    /// Disconnect every subscriber.
    pub fn clear_subscribers(&self) {
        self.inner.subscribers().map.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EventServerStats {
        let rules = self
            .inner
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, counters)| {
                (
                    id.clone(),
                    DeliveryStats {
                        sent: counters.sent.load(Ordering::Relaxed),
                        dropped: counters.dropped.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        EventServerStats {
            subscribers: self.subscriber_count(),
            rules,
        }
    }

    /// Publish subscriber count and per rule delivery counters.
    pub fn send_stats(&self, sink: &dyn StatsSink) -> Result<(), StatsError> {
        let stats = self.stats();

        sink.gauge("event_server.subscribers", stats.subscribers as f64, &[])?;
        for (rule_id, delivery) in stats.rules {
            let tags = [tag("rule_id", &rule_id)];
            sink.gauge("event_server.sent", delivery.sent as f64, &tags)?;
            sink.gauge("event_server.dropped", delivery.dropped as f64, &tags)?;
        }

        Ok(())
    }

    /// Serve the match stream on `listener` until the returned handle is stopped.
    pub fn serve(&self, listener: UnixListener) -> ServerHandle {
        let (tx_shutdown, shutdown) = ShutdownSignal::new();

        let app = Router::new()
            .route(EVENTS_ROUTE, get(event_stream_handler))
            .with_state(ApiState {
                server: self.clone(),
                shutdown: shutdown.clone(),
            });

        let mut graceful = shutdown;
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            graceful.recv().await;
        });

        let server_join_handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("Engine Api server error: {}", e);
            }
        });

        ServerHandle {
            tx_shutdown,
            server_join_handle,
        }
    }
}

/// Receiving side of a subscriber queue. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    server: EventServer,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized [`MatchMessage`], `None` once the server dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.server.unsubscribe(self.id);
    }
}

pub struct ServerHandle {
    tx_shutdown: ShutdownSender,
    server_join_handle: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn stop(self) {
        self.tx_shutdown.send_signal();
        let _ = self.server_join_handle.await;
    }
}

#[derive(Clone)]
struct ApiState {
    server: EventServer,
    shutdown: ShutdownSignal,
}

async fn event_stream_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_matches(socket, state))
}

// Forwards queued matches to the socket until the peer goes away or the
// server stops.
async fn stream_matches(mut socket: WebSocket, state: ApiState) {
    let ApiState {
        server,
        mut shutdown,
    } = state;

    let mut subscription = server.subscribe();
    log::debug!("subscriber {} connected", subscription.id());

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            message = subscription.recv() => match message {
                Some(json) => {
                    if socket.send(Message::Text(json.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    log::debug!("subscriber {} disconnected", subscription.id());
}
