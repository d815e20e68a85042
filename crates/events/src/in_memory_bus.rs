//! In-memory event bus for tests/dev.
//!
//! - One bounded queue per topic; publishing to a full queue fails instead of
//!   blocking.
//! - Every subscription sees every event of its topic. Consumer groups are a
//!   per-group ledger of already-consumed event ids: subscribers of the same
//!   group skip events the group has already taken. This is *not* work
//!   distribution; concurrent subscribers of a group race for each event.
//! - Nothing survives the process, so there is no history or redelivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace};

use ispforge_core::EventId;

use crate::bus::{AdapterMetadata, Capability, EventBus, PublishOptions, SubscribeOptions};
use crate::config::MemoryBusConfig;
use crate::error::{EventBusError, EventBusResult};
use crate::event::{Event, Payload};
use crate::handler::{Delivery, EventHandler, HandlerError, SharedHandler, deliver};
use crate::headers;
use crate::hooks::HookSet;

const ADAPTER_NAME: &str = "memory";
const REPLY_GROUP: &str = "__request_reply__";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded set of event ids, oldest evicted first.
#[derive(Debug)]
struct ConsumedIds {
    capacity: usize,
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl ConsumedIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `false` if the id was already recorded.
    fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Debug)]
struct GroupLedger(Mutex<ConsumedIds>);

impl GroupLedger {
    fn claim(&self, id: EventId) -> bool {
        lock(&self.0).insert(id)
    }
}

type Inboxes = Arc<Mutex<Vec<mpsc::Sender<Event>>>>;

struct TopicQueue {
    sender: mpsc::Sender<Event>,
    /// Taken by the fan-out task when the first subscription starts.
    receiver: Option<mpsc::Receiver<Event>>,
    inboxes: Inboxes,
}

impl TopicQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Some(receiver),
            inboxes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicQueue>,
    groups: HashMap<(String, String), Arc<GroupLedger>>,
    reply_routes: HashSet<String>,
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Event>>>>;

/// In-process pub/sub bus.
pub struct InMemoryEventBus {
    config: MemoryBusConfig,
    metadata: AdapterMetadata,
    hooks: HookSet,
    state: Mutex<State>,
    pending_replies: PendingReplies,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl core::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::build(MemoryBusConfig::default())
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`EventBusError::Config`] when a capacity is zero.
    pub fn with_config(config: MemoryBusConfig) -> EventBusResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: MemoryBusConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            metadata: AdapterMetadata::new(
                ADAPTER_NAME,
                env!("CARGO_PKG_VERSION"),
                "In-process bus with bounded per-topic queues",
                [
                    Capability::Publish,
                    Capability::Subscribe,
                    Capability::ConsumerGroups,
                    Capability::AtLeastOnceDelivery,
                    Capability::RequestReply,
                ],
            ),
            hooks: HookSet::new(),
            state: Mutex::new(State::default()),
            pending_replies: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &MemoryBusConfig {
        &self.config
    }

    fn ensure_open(&self) -> EventBusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        Ok(())
    }

    fn topic_sender(&self, topic: &str) -> mpsc::Sender<Event> {
        let capacity = self.config.queue_capacity;
        lock(&self.state)
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicQueue::new(capacity))
            .sender
            .clone()
    }

    /// Register a subscription and spawn its consumer loop (and the topic's
    /// fan-out task on first use). Never awaits, so callers observe the
    /// subscription as active as soon as this returns.
    fn start_consumer(
        &self,
        topic: &str,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> EventBusResult<()> {
        self.ensure_open()?;
        options.validate()?;

        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.subscriber_buffer);
        let (ledger, fan_out) = {
            let mut state = lock(&self.state);
            let capacity = self.config.queue_capacity;
            let queue = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicQueue::new(capacity));
            lock(&queue.inboxes).push(inbox_tx);
            let fan_out = queue
                .receiver
                .take()
                .map(|receiver| (receiver, queue.inboxes.clone()));

            let dedup_capacity = self.config.dedup_capacity;
            let ledger = state
                .groups
                .entry((topic.to_string(), options.group.clone()))
                .or_insert_with(|| {
                    Arc::new(GroupLedger(Mutex::new(ConsumedIds::new(dedup_capacity))))
                })
                .clone();
            (ledger, fan_out)
        };

        let mut tasks = lock(&self.tasks);
        if let Some((receiver, inboxes)) = fan_out {
            tasks.push(tokio::spawn(fan_out_loop(
                topic.to_string(),
                receiver,
                inboxes,
                self.shutdown.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(consume_loop(ConsumerLoop {
            topic: topic.to_string(),
            options,
            handler,
            ledger,
            inbox: inbox_rx,
            hooks: self.hooks.clone(),
            poll_interval: self.config.poll_interval,
            shutdown: self.shutdown.subscribe(),
        })));
        Ok(())
    }

    fn ensure_reply_route(&self, reply_topic: &str) -> EventBusResult<()> {
        let fresh = lock(&self.state)
            .reply_routes
            .insert(reply_topic.to_string());
        if !fresh {
            return Ok(());
        }
        let router = Arc::new(ReplyRouter {
            pending: self.pending_replies.clone(),
        });
        let started = self.start_consumer(reply_topic, router, SubscribeOptions::group(REPLY_GROUP));
        if started.is_err() {
            lock(&self.state).reply_routes.remove(reply_topic);
        }
        started
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn publish_with(&self, event: &Event, options: PublishOptions) -> EventBusResult<()> {
        self.ensure_open()?;
        let event = options.apply(event);

        match self.topic_sender(event.topic()).try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(EventBusError::publish(
                    &event,
                    format!("topic queue is full (capacity {})", self.config.queue_capacity),
                ));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(EventBusError::Closed),
        }
        self.hooks.publish(&event);
        trace!(adapter = ADAPTER_NAME, topic = event.topic(), event_id = %event.id(), "event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: SharedHandler,
        options: SubscribeOptions,
    ) -> EventBusResult<()> {
        self.start_consumer(topic, handler, options.clone())?;
        info!(
            adapter = ADAPTER_NAME,
            topic,
            group = %options.group,
            concurrency = options.concurrency,
            "subscription started"
        );
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Payload,
        timeout: Duration,
    ) -> EventBusResult<Payload> {
        self.ensure_open()?;
        let reply_topic = format!("{subject}.reply");
        self.ensure_reply_route(&reply_topic)?;

        let correlation_id = uuid::Uuid::now_v7().to_string();
        let request = Event::new(subject, payload)?
            .with_correlation_id(correlation_id.clone())
            .with_headers([(headers::REPLY_TO, reply_topic)]);

        let (tx, rx) = oneshot::channel();
        lock(&self.pending_replies).insert(correlation_id.clone(), tx);

        if let Err(err) = self.publish(&request).await {
            lock(&self.pending_replies).remove(&correlation_id);
            return Err(err);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        lock(&self.pending_replies).remove(&correlation_id);
        match outcome {
            Ok(Ok(reply)) => Ok(reply.into_payload()),
            Ok(Err(_)) => Err(EventBusError::Closed),
            Err(_) => Err(EventBusError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    async fn close(&self) -> EventBusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(err) = task.await {
                debug!(adapter = ADAPTER_NAME, error = %err, "consumer task ended abnormally");
            }
        }

        lock(&self.pending_replies).clear();
        *lock(&self.state) = State::default();
        info!(adapter = ADAPTER_NAME, "event bus closed");
        Ok(())
    }
}

/// Moves events from a topic queue into every subscription inbox.
async fn fan_out_loop(
    topic: String,
    mut queue: mpsc::Receiver<Event>,
    inboxes: Inboxes,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            next = queue.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let targets: Vec<_> = lock(&inboxes).clone();
        for inbox in targets {
            // A closed inbox belongs to a stopped consumer loop.
            let _ = inbox.send(event.clone()).await;
        }
        lock(&inboxes).retain(|inbox| !inbox.is_closed());
    }
    trace!(adapter = ADAPTER_NAME, topic, "fan-out loop stopped");
}

struct ConsumerLoop {
    topic: String,
    options: SubscribeOptions,
    handler: SharedHandler,
    ledger: Arc<GroupLedger>,
    inbox: mpsc::Receiver<Event>,
    hooks: HookSet,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

async fn consume_loop(mut cl: ConsumerLoop) {
    let gate = Arc::new(Semaphore::new(cl.options.concurrency));
    let mut in_flight = JoinSet::new();

    loop {
        if *cl.shutdown.borrow() {
            break;
        }
        let received = tokio::select! {
            _ = cl.shutdown.changed() => break,
            received = tokio::time::timeout(cl.poll_interval, cl.inbox.recv()) => received,
        };
        let event = match received {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_idle) => {
                while in_flight.try_join_next().is_some() {}
                continue;
            }
        };

        if !cl.ledger.claim(event.id()) {
            trace!(
                topic = %cl.topic,
                group = %cl.options.group,
                event_id = %event.id(),
                "event already consumed by group"
            );
            continue;
        }

        let Ok(permit) = gate.clone().acquire_owned().await else {
            break;
        };
        let handler = cl.handler.clone();
        let hooks = cl.hooks.clone();
        let group = cl.options.group.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            if let Delivery::Nack(err) = deliver(handler.as_ref(), event, &group, &hooks).await {
                // Nothing to redeliver from: the event was taken off the queue.
                debug!(group = %group, error = %err, "event dropped after handler failure");
            }
        });
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    trace!(
        adapter = ADAPTER_NAME,
        topic = %cl.topic,
        group = %cl.options.group,
        "consumer loop stopped"
    );
}

/// Resolves pending `request` calls from events on a reply topic.
struct ReplyRouter {
    pending: PendingReplies,
}

#[async_trait]
impl EventHandler for ReplyRouter {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let waiter = event
            .metadata()
            .correlation_id()
            .and_then(|id| lock(&self.pending).remove(id));
        match waiter {
            // The requester may have timed out in the meantime.
            Some(waiter) => {
                let _ = waiter.send(event);
            }
            None => debug!(
                topic = event.topic(),
                event_id = %event.id(),
                "reply without a pending request"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use serde_json::{Value as JsonValue, json};

    use crate::handler::handler_fn;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    fn collector() -> (SharedHandler, Arc<Mutex<Vec<JsonValue>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(JsonValue::Object(event.into_payload()));
                Ok(())
            }
        });
        (handler, seen)
    }

    fn order(id: i64) -> Event {
        Event::from_json("orders.created", json!({"order_id": id})).unwrap()
    }

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let bus = InMemoryEventBus::new();
        let (handler, seen) = collector();
        bus.subscribe("orders.created", handler, SubscribeOptions::default())
            .await
            .unwrap();

        bus.publish(&order(1)).await.unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"order_id": 1})]);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn events_published_before_subscribing_are_queued() {
        let bus = InMemoryEventBus::new();
        bus.publish(&order(1)).await.unwrap();
        bus.publish(&order(2)).await.unwrap();

        let (handler, seen) = collector();
        bus.subscribe("orders.created", handler, SubscribeOptions::default())
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!({"order_id": 1}), json!({"order_id": 2})]
        );
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn group_does_not_reprocess_an_event_for_a_late_subscriber() {
        let bus = InMemoryEventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = |calls: Arc<AtomicUsize>| {
            handler_fn(move |_event| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let event = order(1);
        bus.subscribe("orders.created", counting(calls.clone()), SubscribeOptions::group("billing"))
            .await
            .unwrap();
        bus.publish(&event).await.unwrap();
        settle().await;

        bus.subscribe("orders.created", counting(calls.clone()), SubscribeOptions::group("billing"))
            .await
            .unwrap();
        // Same event id delivered again, e.g. a producer retry.
        bus.publish(&event).await.unwrap();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn every_group_gets_its_own_copy() {
        let bus = InMemoryEventBus::new();
        let (billing, billing_seen) = collector();
        let (audit, audit_seen) = collector();
        bus.subscribe("orders.created", billing, SubscribeOptions::group("billing"))
            .await
            .unwrap();
        bus.subscribe("orders.created", audit, SubscribeOptions::group("audit"))
            .await
            .unwrap();

        bus.publish(&order(7)).await.unwrap();
        settle().await;

        assert_eq!(billing_seen.lock().unwrap().len(), 1);
        assert_eq!(audit_seen.lock().unwrap().len(), 1);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_is_bounded_per_subscription() {
        let bus = InMemoryEventBus::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (r, p, d) = (running.clone(), peak.clone(), done.clone());
        let handler = handler_fn(move |_event| {
            let (running, peak, done) = (r.clone(), p.clone(), d.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.subscribe(
            "orders.created",
            handler,
            SubscribeOptions::default().with_concurrency(3),
        )
        .await
        .unwrap();
        for id in 0..10 {
            bus.publish(&order(id)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) > 1);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn publishing_to_a_full_queue_fails() {
        let bus = InMemoryEventBus::with_config(MemoryBusConfig::default().with_queue_capacity(2)).unwrap();

        bus.publish(&order(1)).await.unwrap();
        bus.publish(&order(2)).await.unwrap();
        let err = bus.publish(&order(3)).await.unwrap_err();

        assert!(matches!(err, EventBusError::Publish { .. }));
    }

    #[test]
    fn zero_capacities_are_rejected_at_construction() {
        let err = InMemoryEventBus::with_config(MemoryBusConfig::default().with_queue_capacity(0))
            .unwrap_err();
        assert!(matches!(err, EventBusError::Config(_)));

        let starved = MemoryBusConfig {
            subscriber_buffer: 0,
            ..MemoryBusConfig::default()
        };
        assert!(matches!(
            InMemoryEventBus::with_config(starved),
            Err(EventBusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_loop() {
        let bus = InMemoryEventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if event.payload()["order_id"] == json!(1) {
                    panic!("poison message");
                }
                Err(HandlerError::new("ValueError", "rejected"))
            }
        });
        bus.subscribe("orders.created", handler, SubscribeOptions::default())
            .await
            .unwrap();

        for id in 1..=3 {
            bus.publish(&order(id)).await.unwrap();
        }
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn request_returns_the_reply_payload() {
        let bus = Arc::new(InMemoryEventBus::new());
        let responder = bus.clone();
        bus.subscribe(
            "svc.ping",
            handler_fn(move |event: Event| {
                let responder = responder.clone();
                async move {
                    let mut pong = Payload::new();
                    pong.insert("pong".to_string(), json!(true));
                    let reply = event.reply(pong).map_err(|e| HandlerError::from_error(&e))?;
                    responder
                        .publish(&reply)
                        .await
                        .map_err(|e| HandlerError::from_error(&e))
                }
            }),
            SubscribeOptions::group("svc"),
        )
        .await
        .unwrap();

        let reply = bus
            .request("svc.ping", Payload::new(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.get("pong"), Some(&json!(true)));
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn request_without_responder_times_out() {
        let bus = InMemoryEventBus::new();
        let started = Instant::now();

        let err = bus
            .request("svc.ping", Payload::new(), Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_use() {
        let bus = InMemoryEventBus::new();
        let (handler, _) = collector();
        bus.subscribe("orders.created", handler.clone(), SubscribeOptions::default())
            .await
            .unwrap();

        bus.close().await.unwrap();
        bus.close().await.unwrap();

        assert!(matches!(bus.publish(&order(1)).await, Err(EventBusError::Closed)));
        assert!(matches!(
            bus.subscribe("orders.created", handler, SubscribeOptions::default()).await,
            Err(EventBusError::Closed)
        ));
    }

    #[test]
    fn consumed_ids_evict_oldest_first() {
        let mut ids = ConsumedIds::new(2);
        let (a, b, c) = (EventId::new(), EventId::new(), EventId::new());

        assert!(ids.insert(a));
        assert!(!ids.insert(a));
        assert!(ids.insert(b));
        assert!(ids.insert(c));
        // `a` fell out of the window.
        assert!(ids.insert(a));
        assert!(!ids.insert(c));
    }
}
