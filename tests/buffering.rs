//! Buffer keep policies and in-order notification delivery.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use stagevisor::{
    start, BufferConfig, BufferKeep, Emit, Init, Peer, Stage, StageSpec, Subscribed, Subscription,
    SubscriptionOptions,
};

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an observation")
        .expect("channel closed")
}

/// Producer fed through `cast`; emits whatever it is handed.
struct Well {
    buffer: BufferConfig,
}

#[async_trait]
impl Stage for Well {
    type In = ();
    type InNotice = ();
    type Out = u64;
    type Notice = String;
    type Call = ();
    type Reply = ();
    type Cast = Vec<u64>;
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::producer().named("well").buffer(self.buffer))
    }

    async fn handle_demand(&mut self, _demand: usize) -> Emit<u64> {
        // Events enter through casts only.
        Emit::none()
    }

    async fn handle_cast(&mut self, batch: Vec<u64>) -> Emit<u64> {
        Emit::events(batch)
    }
}

#[derive(Debug, PartialEq)]
enum Obs {
    Event(u64),
    Notice(String),
}

/// Consumer recording events and notices in arrival order.
struct Recorder {
    tx: mpsc::UnboundedSender<Obs>,
}

#[async_trait]
impl Stage for Recorder {
    type In = u64;
    type InNotice = String;
    type Out = ();
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::consumer().named("recorder"))
    }

    async fn handle_events(&mut self, events: Vec<u64>, _from: &Subscription<u64, String>) -> Emit<()> {
        for n in events {
            let _ = self.tx.send(Obs::Event(n));
        }
        Emit::none()
    }

    async fn handle_notice(&mut self, notice: String, _from: &Subscription<u64, String>) -> Emit<()> {
        let _ = self.tx.send(Obs::Notice(notice));
        Emit::none()
    }
}

/// Manual-demand recorder, for observing deliveries while demand is zero.
struct ManualRecorder {
    tx: mpsc::UnboundedSender<ManualObs>,
    upstream: Option<Subscription<u64, String>>,
}

#[derive(Debug, PartialEq)]
enum ManualObs {
    Ready,
    Event(u64),
    Notice(String),
}

#[async_trait]
impl Stage for ManualRecorder {
    type In = u64;
    type InNotice = String;
    type Out = ();
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = usize;
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::consumer())
    }

    async fn handle_subscribe(
        &mut self,
        peer: Peer<'_, Self>,
        _opts: &SubscriptionOptions,
    ) -> Subscribed {
        if let Peer::Upstream(sub) = peer {
            self.upstream = Some(sub.clone());
            let _ = self.tx.send(ManualObs::Ready);
        }
        Subscribed::Manual
    }

    async fn handle_events(&mut self, events: Vec<u64>, _from: &Subscription<u64, String>) -> Emit<()> {
        for n in events {
            let _ = self.tx.send(ManualObs::Event(n));
        }
        Emit::none()
    }

    async fn handle_notice(&mut self, notice: String, _from: &Subscription<u64, String>) -> Emit<()> {
        let _ = self.tx.send(ManualObs::Notice(notice));
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
async fn keep_last_hands_late_subscribers_the_suffix() {
    let well = start(Well {
        buffer: BufferConfig::bounded(3),
    })
    .await
    .unwrap();
    well.cast(vec![1, 2, 3, 4, 5]).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = start(Recorder { tx }).await.unwrap();
    recorder
        .subscribe(&well.producer_ref(), SubscriptionOptions::with_demand(0, 10))
        .await
        .unwrap();

    for expected in [3, 4, 5] {
        assert_eq!(recv(&mut rx).await, Obs::Event(expected));
    }
    // Later events flow straight through.
    well.cast(vec![6]).unwrap();
    assert_eq!(recv(&mut rx).await, Obs::Event(6));
}

#[tokio::test]
async fn keep_first_hands_late_subscribers_the_prefix() {
    let well = start(Well {
        buffer: BufferConfig::bounded(3).keep(BufferKeep::First),
    })
    .await
    .unwrap();
    well.cast(vec![1, 2, 3, 4, 5]).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = start(Recorder { tx }).await.unwrap();
    recorder
        .subscribe(&well.producer_ref(), SubscriptionOptions::with_demand(0, 10))
        .await
        .unwrap();

    for expected in [1, 2, 3] {
        assert_eq!(recv(&mut rx).await, Obs::Event(expected));
    }
}

#[tokio::test]
async fn notices_arrive_between_the_events_they_were_anchored_to() {
    let well = start(Well {
        buffer: BufferConfig::bounded(5),
    })
    .await
    .unwrap();
    well.cast(vec![10, 11, 12]).unwrap();
    well.sync_notify("checkpoint".to_string()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = start(Recorder { tx }).await.unwrap();
    recorder
        .subscribe(&well.producer_ref(), SubscriptionOptions::with_demand(0, 10))
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, Obs::Event(10));
    assert_eq!(recv(&mut rx).await, Obs::Event(11));
    assert_eq!(recv(&mut rx).await, Obs::Event(12));
    assert_eq!(recv(&mut rx).await, Obs::Notice("checkpoint".to_string()));
}

#[tokio::test]
async fn notify_with_an_empty_buffer_dispatches_immediately() {
    let well = start(Well {
        buffer: BufferConfig::bounded(5),
    })
    .await
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = start(Recorder { tx }).await.unwrap();
    recorder
        .subscribe(&well.producer_ref(), SubscriptionOptions::with_demand(0, 10))
        .await
        .unwrap();

    well.sync_notify("hello".to_string()).await.unwrap();
    assert_eq!(recv(&mut rx).await, Obs::Notice("hello".to_string()));
}

#[tokio::test]
async fn eviction_surfaces_notices_anchored_to_dropped_events() {
    let well = start(Well {
        buffer: BufferConfig::bounded(3),
    })
    .await
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let recorder = start(ManualRecorder { tx, upstream: None }).await.unwrap();
    recorder
        .subscribe(&well.producer_ref(), SubscriptionOptions::with_demand(0, 10))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, ManualObs::Ready);

    // Zero demand: everything buffers.
    well.cast(vec![1, 2, 3]).unwrap();
    well.sync_notify("anchored".to_string()).await.unwrap();
    // Overflow evicts 1..3 and with them the notice's anchor.
    well.cast(vec![4, 5, 6]).unwrap();

    assert_eq!(recv(&mut rx).await, ManualObs::Notice("anchored".to_string()));

    recorder.cast(10).unwrap();
    for expected in [4, 5, 6] {
        assert_eq!(recv(&mut rx).await, ManualObs::Event(expected));
    }
}
