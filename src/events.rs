//! Topic-based publish/subscribe bus shared by every loaded module.
//!
//! Each topic owns a dispatch task fed by an unbounded queue, so publishers
//! never wait for handlers and envelopes of one topic are delivered in publish
//! order. The set of handlers an envelope goes to is fixed when it is
//! published.

use std::any::{Any, type_name};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::debug;

use crate::diagnostics::{Diagnostic, DiagnosticsSink, panic_message};
use crate::types::ModuleId;

pub type SubscriptionId = u64;

/// Opaque event payload. Its shape is a contract between publisher and
/// subscribers.
pub type Payload = Arc<dyn Any + Send + Sync>;

type Handler = Arc<dyn Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// An immutable published event.
pub struct EventEnvelope {
    pub topic: String,
    pub source: ModuleId,
    pub sequence: u64,
    pub timestamp: SystemTime,
    payload: Payload,
}

impl EventEnvelope {
    /// The payload, if it has type `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn raw_payload(&self) -> &Payload {
        &self.payload
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("topic", &self.topic)
            .field("source", &self.source)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Receipt for a registered handler, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub owner: ModuleId,
}

struct Subscriber {
    id: SubscriptionId,
    owner: ModuleId,
    handler: Handler,
    active: AtomicBool,
}

enum Dispatch {
    Publish {
        envelope: Arc<EventEnvelope>,
        targets: Vec<Arc<Subscriber>>,
    },
    Replay {
        envelopes: Vec<Arc<EventEnvelope>>,
        target: Arc<Subscriber>,
    },
}

struct Topic {
    subscribers: Vec<Arc<Subscriber>>,
    history: VecDeque<Arc<EventEnvelope>>,
    queue: mpsc::UnboundedSender<Dispatch>,
}

struct BusInner {
    topics: Mutex<HashMap<String, Topic>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    history_limit: usize,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

/// Process-wide event bus. Cloning yields another handle to the same bus.
///
/// Publishing or subscribing spawns per-topic dispatch tasks, so both must
/// happen inside a Tokio runtime.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `history_limit` is the number of envelopes kept per topic for
    /// [`EventBus::subscribe_with_replay`]; zero disables replay.
    pub fn new(diagnostics: Arc<dyn DiagnosticsSink>, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                next_subscription: AtomicU64::new(1),
                history_limit,
                diagnostics,
            }),
        }
    }

    pub fn publish<T>(&self, topic: &str, payload: T, source: &str) -> Arc<EventEnvelope>
    where
        T: Any + Send + Sync,
    {
        self.publish_shared(topic, Arc::new(payload), source)
    }

    /// Publish an already shared payload. Returns once the envelope is queued.
    pub fn publish_shared(&self, topic: &str, payload: Payload, source: &str) -> Arc<EventEnvelope> {
        let mut topics = self.lock();
        let envelope = Arc::new(EventEnvelope {
            topic: topic.to_string(),
            source: source.to_string(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: SystemTime::now(),
            payload,
        });

        if !topics.contains_key(topic) && self.inner.history_limit == 0 {
            return envelope;
        }
        let entry = self.topic_entry(&mut topics, topic);

        if self.inner.history_limit > 0 {
            entry.history.push_back(envelope.clone());
            while entry.history.len() > self.inner.history_limit {
                entry.history.pop_front();
            }
        }

        let targets: Vec<_> = entry
            .subscribers
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .cloned()
            .collect();
        if !targets.is_empty() {
            // The receiver lives as long as the bus, so a send can only fail
            // during teardown, when dropping the envelope is correct.
            let _ = entry.queue.send(Dispatch::Publish {
                envelope: envelope.clone(),
                targets,
            });
        }
        envelope
    }

    pub fn subscribe<F>(&self, topic: &str, owner: &str, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with_replay(topic, owner, 0, handler)
    }

    /// Subscribe to payloads of type `T`. A payload of any other type is
    /// reported as a handler fault.
    pub fn subscribe_typed<T, F>(&self, topic: &str, owner: &str, handler: F) -> Subscription
    where
        T: Any + Send + Sync,
        F: Fn(&EventEnvelope, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(topic, owner, move |envelope| {
            let payload = envelope.payload::<T>().ok_or_else(|| {
                anyhow::anyhow!(
                    "payload on topic '{}' is not a {}",
                    envelope.topic,
                    type_name::<T>()
                )
            })?;
            handler(envelope, payload)
        })
    }

    /// Subscribe and first receive up to `last` envelopes from the topic's
    /// history, oldest first. Replayed envelopes are delivered before any
    /// envelope published after this call.
    pub fn subscribe_with_replay<F>(
        &self,
        topic: &str,
        owner: &str,
        last: usize,
        handler: F,
    ) -> Subscription
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber {
            id,
            owner: owner.to_string(),
            handler: Arc::new(handler),
            active: AtomicBool::new(true),
        });

        let mut topics = self.lock();
        let entry = self.topic_entry(&mut topics, topic);
        entry.subscribers.push(subscriber.clone());

        if last > 0 {
            let skip = entry.history.len().saturating_sub(last);
            let envelopes: Vec<_> = entry.history.iter().skip(skip).cloned().collect();
            if !envelopes.is_empty() {
                let _ = entry.queue.send(Dispatch::Replay {
                    envelopes,
                    target: subscriber,
                });
            }
        }

        debug!(%topic, %owner, subscription = id, "subscribed");
        Subscription {
            id,
            topic: topic.to_string(),
            owner: owner.to_string(),
        }
    }

    /// Remove a handler. Once this returns no new delivery to it starts; a
    /// delivery already running is allowed to finish.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut topics = self.lock();
        let Some(entry) = topics.get_mut(&subscription.topic) else {
            return false;
        };
        let mut removed = false;
        entry.subscribers.retain(|s| {
            if s.id == subscription.id {
                s.active.store(false, Ordering::SeqCst);
                removed = true;
                false
            } else {
                true
            }
        });
        if entry.subscribers.is_empty() {
            self.drop_idle_topics(&mut topics);
        }
        removed
    }

    /// Remove every handler owned by a module. Returns how many were removed.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut topics = self.lock();
        let mut removed = 0;
        for entry in topics.values_mut() {
            entry.subscribers.retain(|s| {
                if s.owner == owner {
                    s.active.store(false, Ordering::SeqCst);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        if removed > 0 {
            debug!(%owner, removed, "removed subscriptions");
            self.drop_idle_topics(&mut topics);
        }
        removed
    }

    /// Topics that currently have a dispatch task, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    pub fn subscriptions_of(&self, owner: &str) -> Vec<Subscription> {
        let topics = self.lock();
        let mut subscriptions: Vec<_> = topics
            .iter()
            .flat_map(|(topic, entry)| {
                entry
                    .subscribers
                    .iter()
                    .filter(|s| s.owner == owner)
                    .map(|s| Subscription {
                        id: s.id,
                        topic: topic.clone(),
                        owner: s.owner.clone(),
                    })
            })
            .collect();
        subscriptions.sort_by_key(|s| s.id);
        subscriptions
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.inner.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Without history an unsubscribed topic holds nothing worth keeping.
    /// Dropping it closes the queue, so its dispatch loop ends once the
    /// envelopes already queued are delivered.
    fn drop_idle_topics(&self, topics: &mut HashMap<String, Topic>) {
        if self.inner.history_limit == 0 {
            topics.retain(|_, t| !t.subscribers.is_empty());
        }
    }

    fn topic_entry<'a>(
        &self,
        topics: &'a mut HashMap<String, Topic>,
        topic: &str,
    ) -> &'a mut Topic {
        topics.entry(topic.to_string()).or_insert_with(|| {
            let (queue, receiver) = mpsc::unbounded_channel();
            tokio::spawn(dispatch_loop(
                topic.to_string(),
                receiver,
                self.inner.diagnostics.clone(),
            ));
            Topic {
                subscribers: Vec::new(),
                history: VecDeque::new(),
                queue,
            }
        })
    }
}

async fn dispatch_loop(
    topic: String,
    mut receiver: mpsc::UnboundedReceiver<Dispatch>,
    diagnostics: Arc<dyn DiagnosticsSink>,
) {
    while let Some(job) = receiver.recv().await {
        match job {
            Dispatch::Publish { envelope, targets } => {
                for subscriber in &targets {
                    deliver(subscriber, &envelope, diagnostics.as_ref());
                }
            }
            Dispatch::Replay { envelopes, target } => {
                for envelope in &envelopes {
                    deliver(&target, envelope, diagnostics.as_ref());
                }
            }
        }
    }
    debug!(%topic, "dispatch loop stopped");
}

fn deliver(subscriber: &Subscriber, envelope: &EventEnvelope, diagnostics: &dyn DiagnosticsSink) {
    if !subscriber.active.load(Ordering::SeqCst) {
        return;
    }
    let message = match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(envelope))) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{e:#}"),
        Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
    };
    diagnostics.emit(Diagnostic::HandlerFault {
        topic: envelope.topic.clone(),
        subscription: subscriber.id,
        owner: subscriber.owner.clone(),
        sequence: envelope.sequence,
        message,
    });
}

/// Module-scoped view of the bus. Stamps the module id as publisher and
/// owner, and remembers its subscriptions so they can be dropped with the
/// scope.
pub struct ModuleBus {
    bus: EventBus,
    module: ModuleId,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ModuleBus {
    pub(crate) fn new(bus: EventBus, module: ModuleId) -> Self {
        Self {
            bus,
            module,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn publish<T: Any + Send + Sync>(&self, topic: &str, payload: T) -> Arc<EventEnvelope> {
        self.bus.publish(topic, payload, &self.module)
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self.bus.subscribe(topic, &self.module, handler);
        self.track(subscription.clone());
        subscription
    }

    pub fn subscribe_typed<T, F>(&self, topic: &str, handler: F) -> Subscription
    where
        T: Any + Send + Sync,
        F: Fn(&EventEnvelope, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self.bus.subscribe_typed(topic, &self.module, handler);
        self.track(subscription.clone());
        subscription
    }

    pub fn subscribe_with_replay<F>(&self, topic: &str, last: usize, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self
            .bus
            .subscribe_with_replay(topic, &self.module, last, handler);
        self.track(subscription.clone());
        subscription
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.lock().retain(|s| s.id != subscription.id);
        self.bus.unsubscribe(subscription)
    }

    /// Drop every subscription made through this handle.
    pub(crate) fn unsubscribe_all(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.lock());
        subscriptions
            .iter()
            .filter(|s| self.bus.unsubscribe(s))
            .count()
    }

    fn track(&self, subscription: Subscription) {
        self.lock().push(subscription);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ModuleBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBus")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}
