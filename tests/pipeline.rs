//! End-to-end pipeline behavior: ordering, batch bounds, back-pressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use stagevisor::{
    start, Emit, Init, Peer, Stage, StageSpec, Subscribed, Subscription, SubscriptionOptions,
};

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("channel closed")
}

/// Producer counting up from zero, `demand` events per callback.
struct Counter {
    next: u64,
    emitted: Arc<AtomicU64>,
}

impl Counter {
    fn new() -> Self {
        Counter {
            next: 0,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl Stage for Counter {
    type In = ();
    type InNotice = ();
    type Out = u64;
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::producer().named("counter"))
    }

    async fn handle_demand(&mut self, demand: usize) -> Emit<u64> {
        let batch: Vec<u64> = (self.next..self.next + demand as u64).collect();
        self.next += demand as u64;
        self.emitted.fetch_add(demand as u64, Ordering::SeqCst);
        Emit::events(batch)
    }
}

/// Transform multiplying every event by two.
struct Doubler;

#[async_trait]
impl Stage for Doubler {
    type In = u64;
    type InNotice = ();
    type Out = u64;
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::producer_consumer().named("doubler"))
    }

    async fn handle_events(&mut self, events: Vec<u64>, _from: &Subscription<u64, ()>) -> Emit<u64> {
        Emit::events(events.into_iter().map(|n| n * 2))
    }
}

/// Consumer forwarding every event into a channel.
struct Collector {
    tx: mpsc::UnboundedSender<u64>,
}

#[async_trait]
impl Stage for Collector {
    type In = u64;
    type InNotice = ();
    type Out = ();
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::consumer().named("collector"))
    }

    async fn handle_events(&mut self, events: Vec<u64>, _from: &Subscription<u64, ()>) -> Emit<()> {
        for n in events {
            let _ = self.tx.send(n);
        }
        Emit::none()
    }
}

/// Consumer reporting the size of every delivered batch.
struct BatchSizes {
    tx: mpsc::UnboundedSender<usize>,
}

#[async_trait]
impl Stage for BatchSizes {
    type In = u64;
    type InNotice = ();
    type Out = ();
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::consumer())
    }

    async fn handle_events(&mut self, events: Vec<u64>, _from: &Subscription<u64, ()>) -> Emit<()> {
        let _ = self.tx.send(events.len());
        Emit::none()
    }
}

/// Manual-demand consumer: asks only when told to through `cast`.
struct ManualSink {
    tx: mpsc::UnboundedSender<ManualEvent>,
    upstream: Option<Subscription<u64, ()>>,
}

enum ManualEvent {
    Ready,
    Event(u64),
}

#[async_trait]
impl Stage for ManualSink {
    type In = u64;
    type InNotice = ();
    type Out = ();
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = usize;
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::consumer().named("manual-sink"))
    }

    async fn handle_subscribe(
        &mut self,
        peer: Peer<'_, Self>,
        _opts: &SubscriptionOptions,
    ) -> Subscribed {
        if let Peer::Upstream(sub) = peer {
            self.upstream = Some(sub.clone());
            let _ = self.tx.send(ManualEvent::Ready);
        }
        Subscribed::Manual
    }

    async fn handle_events(&mut self, events: Vec<u64>, _from: &Subscription<u64, ()>) -> Emit<()> {
        for n in events {
            let _ = self.tx.send(ManualEvent::Event(n));
        }
        Emit::none()
    }

    async fn handle_cast(&mut self, count: usize) -> Emit<()> {
        if let Some(upstream) = &self.upstream {
            upstream.ask(count);
        }
        Emit::none()
    }
}

#[tokio::test]
async fn three_stage_pipeline_doubles_in_order() {
    let counter = start(Counter::new()).await.unwrap();
    let doubler = start(Doubler).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let collector = start(Collector { tx }).await.unwrap();

    // Wire back-to-front so no demand reaches an unwired stage.
    collector
        .subscribe(&doubler.producer_ref(), SubscriptionOptions::with_demand(5, 10))
        .await
        .unwrap();
    doubler
        .subscribe(&counter.producer_ref(), SubscriptionOptions::with_demand(5, 10))
        .await
        .unwrap();

    let mut received = Vec::with_capacity(100);
    for _ in 0..100 {
        received.push(recv(&mut rx).await);
    }
    let expected: Vec<u64> = (0..100).map(|n| n * 2).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn batches_never_exceed_the_refill_window() {
    let counter = start(Counter::new()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sizes = start(BatchSizes { tx }).await.unwrap();

    sizes
        .subscribe(&counter.producer_ref(), SubscriptionOptions::with_demand(5, 10))
        .await
        .unwrap();

    // max_demand - min_demand bounds every delivered batch.
    let mut total = 0;
    while total < 100 {
        let size = recv(&mut rx).await;
        assert!(size <= 5, "batch of {size} exceeds the refill window");
        assert!(size >= 1);
        total += size;
    }
}

#[tokio::test]
async fn producers_never_outrun_manual_demand() {
    let counter = Counter::new();
    let emitted = Arc::clone(&counter.emitted);
    let producer = start(counter).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = start(ManualSink { tx, upstream: None }).await.unwrap();

    sink.subscribe(&producer.producer_ref(), SubscriptionOptions::default())
        .await
        .unwrap();
    assert!(matches!(recv(&mut rx).await, ManualEvent::Ready));

    // No ask issued yet: nothing may have been produced.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(emitted.load(Ordering::SeqCst), 0);

    sink.cast(7).unwrap();
    for expected in 0..7u64 {
        match recv(&mut rx).await {
            ManualEvent::Event(n) => assert_eq!(n, expected),
            ManualEvent::Ready => panic!("unexpected ready marker"),
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(emitted.load(Ordering::SeqCst), 7);
    assert!(rx.try_recv().is_err(), "events beyond asked demand");
}
