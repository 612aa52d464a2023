//! # Stage cell: the runtime record behind one stage task.
//!
//! Owns the user state, the dispatcher, the outbound buffer, and the three
//! subscription maps (consumers, producers, pre-ack pending). Exactly one
//! envelope is handled at a time; every event-emitting callback feeds the
//! dispatch pipeline before the next envelope is touched.
//!
//! ## Routing
//! ```text
//! Envelope::Produce ──► producer side (subscribe / ask / cancel)
//! Envelope::Consume ──► consumer side (ack / events / notice / cancel)
//! Envelope::Down ─────► whichever side the monitor belongs to
//! Envelope::Call/Cast/Info ──► user callbacks, emissions dispatched
//! Envelope::Command ──► handle surface (subscribe, notify, stop, …)
//! ```
//!
//! The producer-side pipeline lives in `producer.rs`, the consumer-side
//! state machine in `consumer.rs`; this file owns the shared record and
//! the role checks.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::{debug, error};

use crate::config::{CancelPolicy, DemandBounds, SubscriptionOptions};
use crate::core::bridge::PcBridge;
use crate::core::buffer::EventBuffer;
use crate::core::demand::DemandWindow;
use crate::dispatch::Dispatcher;
use crate::error::StageError;
use crate::handle::StageAddr;
use crate::message::{Command, ConsumerMsg, Envelope, ProducerMsg};
use crate::monitor::MonitorId;
use crate::reason::{Disconnect, ExitReason};
use crate::stage::{Emit, Peer, Replier, Stage, StageSpec, StageType};
use crate::subscription::{ProducerRef, Subscription, SubscriptionId};

/// Whether the stage keeps running after handling an envelope.
pub(crate) enum Flow {
    Continue,
    Stop(ExitReason),
}

/// A consumer subscribed to this stage.
pub(super) struct ConsumerSlot<S: Stage> {
    pub link: Subscription<S::Out, S::Notice>,
    pub monitor: MonitorId,
}

/// How demand is driven on one upstream subscription.
pub(super) enum DemandMode {
    /// Runtime-managed window with automatic top-ups.
    Auto(DemandWindow),
    /// User-driven via `Subscription::ask`.
    Manual,
    /// Producer-consumer passthrough: downstream demand pulls, upstream is
    /// re-asked as forwarded batches are consumed.
    Forward,
}

/// A producer this stage subscribed to (handshake complete).
pub(super) struct ProducerSlot<S: Stage> {
    pub link: Subscription<S::In, S::InNotice>,
    pub cancel: CancelPolicy,
    pub mode: DemandMode,
    pub monitor: MonitorId,
}

/// A subscription sent but not yet acknowledged.
pub(super) struct PendingSub<S: Stage> {
    pub link: Subscription<S::In, S::InNotice>,
    pub opts: SubscriptionOptions,
    pub bounds: DemandBounds,
    pub monitor: MonitorId,
}

/// What a monitor was watching.
pub(super) enum MonitorTarget {
    /// A live subscription, on either side.
    Subscription(SubscriptionId),
    /// A producer we subscribed to but which has not acknowledged yet.
    PreAck(SubscriptionId),
}

pub(crate) struct StageCell<S: Stage> {
    pub(super) stage: S,
    pub(super) kind: StageType,
    pub(super) label: Cow<'static, str>,
    pub(super) addr: StageAddr<S>,
    pub(super) dispatcher: Box<dyn Dispatcher<S::Out, S::Notice>>,
    pub(super) buffer: EventBuffer<S::Out, S::Notice>,
    pub(super) consumers: HashMap<SubscriptionId, ConsumerSlot<S>>,
    pub(super) producers: HashMap<SubscriptionId, ProducerSlot<S>>,
    pub(super) pending: HashMap<SubscriptionId, PendingSub<S>>,
    pub(super) monitors: HashMap<MonitorId, MonitorTarget>,
    pub(super) bridge: PcBridge<S::In, S::InNotice>,
}

type SubscribeTo<S> = Vec<(
    ProducerRef<<S as Stage>::In, <S as Stage>::InNotice>,
    SubscriptionOptions,
)>;

impl<S: Stage> StageCell<S> {
    /// Builds the cell from a validated spec, handing back the upstream
    /// subscriptions to make once the stage is ready.
    pub(crate) fn new(stage: S, spec: StageSpec<S>, addr: StageAddr<S>) -> (Self, SubscribeTo<S>) {
        let label = spec
            .name
            .unwrap_or_else(|| Cow::Owned(addr.id().to_string()));
        let cell = StageCell {
            stage,
            kind: spec.stage_type,
            label,
            addr,
            dispatcher: spec.dispatcher,
            buffer: EventBuffer::new(&spec.buffer),
            consumers: HashMap::new(),
            producers: HashMap::new(),
            pending: HashMap::new(),
            monitors: HashMap::new(),
            bridge: PcBridge::new(),
        };
        (cell, spec.subscribe_to)
    }

    pub(crate) async fn terminate(&mut self, reason: &ExitReason) {
        self.stage.terminate(reason).await;
    }

    /// Handles one envelope to completion.
    pub(crate) async fn handle(&mut self, envelope: Envelope<S>) -> Flow {
        match envelope {
            Envelope::Produce(msg) => self.on_producer_msg(msg).await,
            Envelope::Consume(msg) => self.on_consumer_msg(msg).await,
            Envelope::Down { monitor, reason } => self.on_down(monitor, reason).await,
            Envelope::Call { request, reply } => {
                let emit = self.stage.handle_call(request, Replier::new(reply)).await;
                self.apply(emit)
            }
            Envelope::Cast { msg } => {
                let emit = self.stage.handle_cast(msg).await;
                self.apply(emit)
            }
            Envelope::Info { msg } => {
                let emit = self.stage.handle_info(msg).await;
                self.apply(emit)
            }
            Envelope::Command(command) => self.on_command(command).await,
        }
    }

    /// Dispatches callback emissions, or stops.
    pub(super) fn apply(&mut self, emit: Emit<S::Out>) -> Flow {
        match emit {
            Emit::Events(events) => {
                self.dispatch_events(events);
                Flow::Continue
            }
            Emit::Stop(reason) => Flow::Stop(reason),
        }
    }

    async fn on_producer_msg(&mut self, msg: ProducerMsg<S::Out, S::Notice>) -> Flow {
        if self.kind == StageType::Consumer {
            let (ProducerMsg::Subscribe { from, .. }
            | ProducerMsg::Ask { from, .. }
            | ProducerMsg::Cancel { from, .. }) = &msg;
            error!(
                stage = %self.label,
                subscription = %from.id(),
                "consumer received a producer-directed message"
            );
            from.send_cancel(ExitReason::error("stage is not a producer"));
            return Flow::Continue;
        }
        match msg {
            ProducerMsg::Subscribe { from, opts } => self.on_subscribe(from, opts).await,
            ProducerMsg::Ask { from, count } => self.on_ask(from, count).await,
            ProducerMsg::Cancel { from, reason } => {
                let id = from.id();
                if self.consumers.contains_key(&id) {
                    self.drop_consumer(id, Disconnect::Cancel(reason), true).await
                } else {
                    debug!(
                        stage = %self.label,
                        subscription = %id,
                        "dropping cancel for unknown subscription"
                    );
                    Flow::Continue
                }
            }
        }
    }

    async fn on_consumer_msg(&mut self, msg: ConsumerMsg<S::In, S::InNotice>) -> Flow {
        if self.kind == StageType::Producer {
            match msg {
                // Never answer a cancel: the other side already let go.
                ConsumerMsg::Cancel { .. } => {}
                ConsumerMsg::Ack { from }
                | ConsumerMsg::Events { from, .. }
                | ConsumerMsg::Notice { from, .. } => {
                    error!(
                        stage = %self.label,
                        subscription = %from.id(),
                        "producer received a consumer-directed message"
                    );
                    from.cancel(ExitReason::error("stage is not a consumer"));
                }
            }
            return Flow::Continue;
        }
        match msg {
            ConsumerMsg::Ack { from } => self.on_ack(from).await,
            ConsumerMsg::Events { from, events } => self.on_events(from, events).await,
            ConsumerMsg::Notice { from, msg } => self.on_notice(from, msg).await,
            ConsumerMsg::Cancel { from, reason } => self.on_peer_cancel(from, reason).await,
        }
    }

    async fn on_down(&mut self, monitor: MonitorId, reason: ExitReason) -> Flow {
        let Some(target) = self.monitors.remove(&monitor) else {
            // Raced with an explicit cancel; the registration is gone.
            return Flow::Continue;
        };
        match target {
            MonitorTarget::PreAck(id) => {
                let Some(pending) = self.pending.remove(&id) else {
                    return Flow::Continue;
                };
                // The subscription never materialised: no handle_cancel,
                // only the cancel policy applies.
                match pending.opts.cancel {
                    CancelPolicy::Permanent => Flow::Stop(reason),
                    CancelPolicy::Temporary => Flow::Continue,
                }
            }
            MonitorTarget::Subscription(id) => {
                if self.consumers.contains_key(&id) {
                    self.drop_consumer(id, Disconnect::Down(reason), false).await
                } else if self.producers.contains_key(&id) {
                    self.drop_producer(id, Disconnect::Down(reason)).await
                } else {
                    Flow::Continue
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command<S>) -> Flow {
        match command {
            Command::Subscribe { to, opts, reply } => {
                if self.kind == StageType::Producer {
                    let _ = reply.send(Err(StageError::bad_opts(
                        "producers cannot subscribe upstream",
                    )));
                    return Flow::Continue;
                }
                self.subscribe_upstream(to, opts, Some(reply))
            }
            Command::Cancel {
                subscription,
                reason,
            } => self.cancel_subscription(subscription, reason).await,
            Command::Notify { msg, reply } => {
                if self.kind == StageType::Consumer {
                    let _ = reply.send(Err(StageError::NotAProducer));
                    return Flow::Continue;
                }
                if self.buffer.is_empty() {
                    self.dispatcher.notify(msg);
                } else {
                    self.buffer.put_notice(msg);
                }
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            Command::Stop { reason } => Flow::Stop(reason),
        }
    }

    /// Cancellation through the handle; works on whichever side owns the
    /// reference.
    async fn cancel_subscription(&mut self, id: SubscriptionId, reason: ExitReason) -> Flow {
        if self.consumers.contains_key(&id) {
            return self.drop_consumer(id, Disconnect::Cancel(reason), true).await;
        }
        if let Some(slot) = self.producers.get(&id) {
            // The producer tears down and confirms; our handle_cancel runs
            // when the confirmation arrives.
            slot.link.cancel(reason);
            return Flow::Continue;
        }
        if let Some(pending) = self.pending.remove(&id) {
            self.monitors.remove(&pending.monitor);
            pending.link.producer().unwatch(pending.monitor);
            pending.link.cancel(reason.clone());
            return match pending.opts.cancel {
                CancelPolicy::Permanent => Flow::Stop(reason),
                CancelPolicy::Temporary => Flow::Continue,
            };
        }
        debug!(
            stage = %self.label,
            subscription = %id,
            "cancel requested for unknown subscription"
        );
        Flow::Continue
    }

    /// Tears down an upstream subscription: callback, then cancel policy.
    pub(super) async fn drop_producer(&mut self, id: SubscriptionId, disconnect: Disconnect) -> Flow {
        let Some(slot) = self.producers.remove(&id) else {
            return Flow::Continue;
        };
        self.monitors.remove(&slot.monitor);
        slot.link.producer().unwatch(slot.monitor);
        let reason = disconnect.reason().clone();
        let emit = self
            .stage
            .handle_cancel(disconnect, Peer::Upstream(&slot.link))
            .await;
        match self.apply(emit) {
            Flow::Stop(stop) => Flow::Stop(stop),
            Flow::Continue => match slot.cancel {
                CancelPolicy::Permanent => Flow::Stop(reason),
                CancelPolicy::Temporary => Flow::Continue,
            },
        }
    }

    /// Tears down a downstream subscription: callback first, then the
    /// dispatcher learns, then any freed demand is satisfied.
    pub(super) async fn drop_consumer(
        &mut self,
        id: SubscriptionId,
        disconnect: Disconnect,
        notify_peer: bool,
    ) -> Flow {
        let Some(slot) = self.consumers.remove(&id) else {
            return Flow::Continue;
        };
        self.monitors.remove(&slot.monitor);
        slot.link.consumer().unwatch(slot.monitor);
        if notify_peer {
            slot.link.send_cancel(disconnect.reason().clone());
        }
        let emit = self
            .stage
            .handle_cancel(disconnect, Peer::Downstream(&slot.link))
            .await;
        if let Flow::Stop(reason) = self.apply(emit) {
            return Flow::Stop(reason);
        }
        let counter = self.dispatcher.cancel(&slot.link);
        if counter > 0 {
            return self.satisfy(counter).await;
        }
        Flow::Continue
    }
}
