//! # Producer-side dispatch pipeline.
//!
//! Everything a stage does with outbound events:
//!
//! ```text
//! callback emissions ──► dispatch_events
//!                           ├─ no consumers ──► buffer (keep policy)
//!                           └─ dispatcher.dispatch ──► undispatched ──► buffer
//!
//! subscribe / ask / cancel ──► dispatcher grants counter ──► satisfy
//!                           ├─ drain buffer (events + anchored notices, in order)
//!                           └─ residual ──► handle_demand   (producer)
//!                                        └► bridge          (producer-consumer)
//! ```
//!
//! ## Rules
//! - The dispatcher callout runs after the user's `handle_subscribe` /
//!   `handle_cancel`, so user code observes the subscription first.
//! - The drain loop stops at notification boundaries and re-buffers what
//!   the dispatcher could not place; a pass with no progress ends the
//!   drain rather than spinning.

use tracing::{debug, error, warn};

use crate::config::SubscriptionOptions;
use crate::core::cell::{ConsumerSlot, Flow, MonitorTarget, StageCell};
use crate::reason::ExitReason;
use crate::stage::{Peer, Stage, StageType, Subscribed};
use crate::subscription::{Subscription, SubscriptionId};

impl<S: Stage> StageCell<S> {
    /// A consumer wants to subscribe: monitor it, ack, let the user and
    /// then the dispatcher know.
    pub(super) async fn on_subscribe(
        &mut self,
        from: Subscription<S::Out, S::Notice>,
        opts: SubscriptionOptions,
    ) -> Flow {
        let id = from.id();
        if self.consumers.contains_key(&id) {
            error!(
                stage = %self.label,
                subscription = %id,
                "duplicated subscription"
            );
            from.send_cancel(ExitReason::DuplicatedSubscription);
            return Flow::Continue;
        }
        let monitor = from.consumer().watch(self.addr.down_sink());
        self.monitors.insert(monitor, MonitorTarget::Subscription(id));
        self.consumers.insert(
            id,
            ConsumerSlot {
                link: from.clone(),
                monitor,
            },
        );
        from.send_ack();

        let subscribed = self
            .stage
            .handle_subscribe(Peer::Downstream(&from), &opts)
            .await;
        if let Subscribed::Stop(reason) = subscribed {
            return Flow::Stop(reason);
        }
        // Automatic and manual are one and the same on the producer side;
        // demand modes belong to the consumer half of the handshake.
        match self.dispatcher.subscribe(&opts, &from) {
            Ok(counter) if counter > 0 => self.satisfy(counter).await,
            Ok(_) => Flow::Continue,
            Err(err) => {
                error!(
                    stage = %self.label,
                    subscription = %id,
                    error = %err,
                    "dispatcher rejected the subscription"
                );
                self.remove_consumer_quietly(id);
                from.send_cancel(ExitReason::error(err.to_string()));
                Flow::Continue
            }
        }
    }

    pub(super) async fn on_ask(
        &mut self,
        from: Subscription<S::Out, S::Notice>,
        count: usize,
    ) -> Flow {
        let id = from.id();
        if count == 0 {
            debug!(stage = %self.label, subscription = %id, "ignoring ask for zero events");
            return Flow::Continue;
        }
        if !self.consumers.contains_key(&id) {
            from.send_cancel(ExitReason::UnknownSubscription);
            return Flow::Continue;
        }
        let counter = self.dispatcher.ask(count, &from);
        if counter > 0 {
            self.satisfy(counter).await
        } else {
            Flow::Continue
        }
    }

    /// Routes callback emissions into the pipeline.
    pub(super) fn dispatch_events(&mut self, events: Vec<S::Out>) {
        if events.is_empty() {
            return;
        }
        if self.kind == StageType::Consumer {
            error!(
                stage = %self.label,
                count = events.len(),
                "consumer callbacks cannot emit events; discarding"
            );
            return;
        }
        if self.consumers.is_empty() {
            self.buffer_events(events);
            return;
        }
        let undispatched = self.dispatcher.dispatch(events);
        if !undispatched.is_empty() {
            self.buffer_events(undispatched);
        }
    }

    fn buffer_events(&mut self, events: Vec<S::Out>) {
        let stored = self.buffer.store(events);
        if stored.dropped > 0 {
            warn!(
                stage = %self.label,
                discarded = stored.dropped,
                "buffer overflow; events discarded"
            );
        }
        // Notifications whose anchor events were evicted surface now, after
        // the append, still in their enqueue order.
        for notice in stored.ready {
            self.dispatcher.notify(notice);
        }
    }

    /// Satisfies freshly granted demand: buffered events first, then the
    /// role-specific residual path.
    pub(super) async fn satisfy(&mut self, counter: usize) -> Flow {
        let mut counter = counter;
        while counter > 0 && !self.buffer.is_empty() {
            let taken = self.buffer.take(counter);
            if taken.events.is_empty() && taken.notices.is_empty() {
                break;
            }
            counter -= taken.events.len();
            let mut progressed = !taken.notices.is_empty();
            if !taken.events.is_empty() {
                let total = taken.events.len();
                let undispatched = self.dispatcher.dispatch(taken.events);
                progressed = progressed || undispatched.len() < total;
                if !undispatched.is_empty() {
                    self.buffer_events(undispatched);
                }
            }
            for notice in taken.notices {
                self.dispatcher.notify(notice);
            }
            if !progressed {
                break;
            }
        }
        if counter == 0 {
            return Flow::Continue;
        }
        match self.kind {
            StageType::Producer => {
                let emit = self.stage.handle_demand(counter).await;
                self.apply(emit)
            }
            StageType::ProducerConsumer => {
                let due = self.bridge.add_demand(counter);
                for batch in due {
                    if let Flow::Stop(reason) = self.deliver_transform_batch(batch).await {
                        return Flow::Stop(reason);
                    }
                }
                Flow::Continue
            }
            StageType::Consumer => Flow::Continue,
        }
    }

    fn remove_consumer_quietly(&mut self, id: SubscriptionId) {
        if let Some(slot) = self.consumers.remove(&id) {
            self.monitors.remove(&slot.monitor);
            slot.link.consumer().unwatch(slot.monitor);
        }
    }
}
