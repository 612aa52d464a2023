//! Subscription teardown: cancel policies, crash propagation, idempotence.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use stagevisor::{
    start, Disconnect, Emit, ExitReason, Init, Peer, Stage, StageError, StageSpec, Subscribed,
    SubscriptionId, SubscriptionOptions,
};

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an observation")
        .expect("channel closed")
}

async fn expect_silence<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Ok(unexpected) = rx.try_recv() {
        panic!("expected silence, got {unexpected:?}");
    }
}

/// Bare producer; emits nothing unless asked through a cast.
struct Quiet;

#[async_trait]
impl Stage for Quiet {
    type In = ();
    type InNotice = ();
    type Out = u64;
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::producer().named("quiet"))
    }

    async fn handle_demand(&mut self, _demand: usize) -> Emit<u64> {
        Emit::none()
    }
}

#[derive(Debug, PartialEq)]
enum Obs {
    Subscribed(SubscriptionId),
    Cancelled(Disconnect),
    Ping,
}

/// Consumer observing its subscription lifecycle.
struct Watcher {
    tx: mpsc::UnboundedSender<Obs>,
}

#[async_trait]
impl Stage for Watcher {
    type In = u64;
    type InNotice = ();
    type Out = ();
    type Notice = ();
    type Call = ();
    type Reply = ();
    type Cast = ();
    type Info = ();

    async fn init(&mut self) -> Init<Self> {
        Init::Start(StageSpec::consumer().named("watcher"))
    }

    async fn handle_subscribe(
        &mut self,
        peer: Peer<'_, Self>,
        _opts: &SubscriptionOptions,
    ) -> Subscribed {
        let _ = self.tx.send(Obs::Subscribed(peer.subscription_id()));
        Subscribed::Automatic
    }

    async fn handle_cancel(&mut self, disconnect: Disconnect, _peer: Peer<'_, Self>) -> Emit<()> {
        let _ = self.tx.send(Obs::Cancelled(disconnect));
        Emit::none()
    }

    async fn handle_cast(&mut self, _msg: ()) -> Emit<()> {
        let _ = self.tx.send(Obs::Ping);
        Emit::none()
    }
}

#[tokio::test]
async fn permanent_consumer_inherits_the_producer_exit_reason() {
    let producer = start(Quiet).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    watcher
        .subscribe(&producer.producer_ref(), SubscriptionOptions::default())
        .await
        .unwrap();
    assert!(matches!(recv(&mut rx).await, Obs::Subscribed(_)));

    producer.stop(ExitReason::error("boom")).unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Obs::Cancelled(Disconnect::Down(ExitReason::error("boom")))
    );
    assert_eq!(watcher.join().await, ExitReason::error("boom"));
}

#[tokio::test]
async fn temporary_consumer_survives_the_producer() {
    let producer = start(Quiet).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    watcher
        .subscribe(&producer.producer_ref(), SubscriptionOptions::temporary())
        .await
        .unwrap();
    assert!(matches!(recv(&mut rx).await, Obs::Subscribed(_)));

    producer.stop(ExitReason::error("boom")).unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Obs::Cancelled(Disconnect::Down(ExitReason::error("boom")))
    );
    // Still alive and responsive.
    watcher.cast(()).unwrap();
    assert_eq!(recv(&mut rx).await, Obs::Ping);
}

#[tokio::test]
async fn cancelling_twice_runs_handle_cancel_once() {
    let producer = start(Quiet).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    let subscription = watcher
        .subscribe(&producer.producer_ref(), SubscriptionOptions::temporary())
        .await
        .unwrap();
    assert!(matches!(recv(&mut rx).await, Obs::Subscribed(_)));

    watcher.cancel(subscription, ExitReason::Normal).unwrap();
    watcher.cancel(subscription, ExitReason::Normal).unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Obs::Cancelled(Disconnect::Cancel(ExitReason::Normal))
    );
    expect_silence(&mut rx).await;
}

#[tokio::test]
async fn voluntary_cancel_stops_a_permanent_consumer() {
    let producer = start(Quiet).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    let subscription = watcher
        .subscribe(&producer.producer_ref(), SubscriptionOptions::default())
        .await
        .unwrap();
    assert!(matches!(recv(&mut rx).await, Obs::Subscribed(_)));

    watcher.cancel(subscription, ExitReason::Normal).unwrap();

    assert_eq!(
        recv(&mut rx).await,
        Obs::Cancelled(Disconnect::Cancel(ExitReason::Normal))
    );
    assert_eq!(watcher.join().await, ExitReason::Normal);
}

#[tokio::test]
async fn subscribing_to_a_dead_producer_depends_on_the_policy() {
    let producer = start(Quiet).await.unwrap();
    let reference = producer.producer_ref();
    producer.stop(ExitReason::Normal).unwrap();
    assert_eq!(producer.join().await, ExitReason::Normal);

    // Permanent: the subscription failure is fatal.
    let (tx, _rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    let err = watcher
        .subscribe(&reference, SubscriptionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::NoProc));
    assert_eq!(watcher.join().await, ExitReason::NoProc);

    // Temporary: a reference is fabricated and life goes on.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    watcher
        .subscribe(&reference, SubscriptionOptions::temporary())
        .await
        .unwrap();
    watcher.cast(()).unwrap();
    assert_eq!(recv(&mut rx).await, Obs::Ping);
}

#[tokio::test]
async fn invalid_subscription_options_fail_the_caller_only() {
    let producer = start(Quiet).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();

    let err = watcher
        .subscribe(&producer.producer_ref(), SubscriptionOptions::with_demand(10, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::BadOpts { .. }));

    watcher.cast(()).unwrap();
    assert_eq!(recv(&mut rx).await, Obs::Ping);
}

#[tokio::test]
async fn shutdown_token_exits_cleanly() {
    let producer = start(Quiet).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = start(Watcher { tx }).await.unwrap();
    watcher
        .subscribe(&producer.producer_ref(), SubscriptionOptions::temporary())
        .await
        .unwrap();
    assert!(matches!(recv(&mut rx).await, Obs::Subscribed(_)));

    producer.shutdown();
    assert_eq!(producer.join().await, ExitReason::Shutdown);
    // The consumer sees the shutdown as a down with the same reason.
    assert_eq!(
        recv(&mut rx).await,
        Obs::Cancelled(Disconnect::Down(ExitReason::Shutdown))
    );
}
