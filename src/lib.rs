//! # stagevisor
//!
//! **Stagevisor** is a demand-driven staged pipeline runtime: a library for
//! composing long-lived stages that exchange batches of events under
//! explicit back-pressure. Consumers subscribe to producers and ask for a
//! bounded number of events; producers never send more than was asked and
//! buffer the overflow under a configurable keep policy.
//!
//! ## Features
//!
//! | Area               | Description                                                          | Key types / traits                          |
//! |--------------------|----------------------------------------------------------------------|---------------------------------------------|
//! | **Stages**         | Producer / consumer / transform behaviours as async callbacks.        | [`Stage`], [`StageSpec`], [`Emit`]           |
//! | **Demand**         | Per-subscription demand windows with automatic top-ups, manual mode.   | [`SubscriptionOptions`], [`Subscription`]    |
//! | **Dispatching**    | Pluggable routing of events to consumers.                              | [`Dispatcher`], [`DemandDispatcher`], [`BroadcastDispatcher`], [`PartitionDispatcher`] |
//! | **Buffering**      | Bounded producer buffers with first/last keep policies.                | [`BufferConfig`], [`Capacity`], [`BufferKeep`] |
//! | **Notifications**  | Out-of-band messages ordered against the event stream.                 | [`StageHandle::sync_notify`], [`Stage::handle_notice`] |
//! | **Liveness**       | Peer monitoring; producer loss cancels or stops consumers.             | [`CancelPolicy`], [`Disconnect`], [`ExitReason`] |
//! | **Errors**         | Typed start-time and runtime errors.                                   | [`StartError`], [`StageError`]               |
//!
//! ## A two-stage pipeline
//!
//! ```no_run
//! use async_trait::async_trait;
//! use stagevisor::{
//!     start, Emit, Init, Stage, StageSpec, Subscription, SubscriptionOptions,
//! };
//!
//! struct Numbers {
//!     next: u64,
//! }
//!
//! #[async_trait]
//! impl Stage for Numbers {
//!     type In = ();
//!     type InNotice = ();
//!     type Out = u64;
//!     type Notice = ();
//!     type Call = ();
//!     type Reply = ();
//!     type Cast = ();
//!     type Info = ();
//!
//!     async fn init(&mut self) -> Init<Self> {
//!         Init::Start(StageSpec::producer().named("numbers"))
//!     }
//!
//!     async fn handle_demand(&mut self, demand: usize) -> Emit<u64> {
//!         let batch: Vec<u64> = (self.next..self.next + demand as u64).collect();
//!         self.next += demand as u64;
//!         Emit::events(batch)
//!     }
//! }
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl Stage for Printer {
//!     type In = u64;
//!     type InNotice = ();
//!     type Out = ();
//!     type Notice = ();
//!     type Call = ();
//!     type Reply = ();
//!     type Cast = ();
//!     type Info = ();
//!
//!     async fn init(&mut self) -> Init<Self> {
//!         Init::Start(StageSpec::consumer().named("printer"))
//!     }
//!
//!     async fn handle_events(
//!         &mut self,
//!         events: Vec<u64>,
//!         _from: &Subscription<u64, ()>,
//!     ) -> Emit<()> {
//!         for n in events {
//!             println!("{n}");
//!         }
//!         Emit::none()
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let numbers = start(Numbers { next: 0 }).await?;
//!     let printer = start(Printer).await?;
//!     printer
//!         .subscribe(
//!             &numbers.producer_ref(),
//!             SubscriptionOptions::with_demand(500, 1000),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Events delivered on a subscription never exceed the demand asked on it.
//! - Events and notifications arrive in the order the producer emitted them.
//! - Bounded buffers never hold more than their capacity; overflow follows
//!   the keep policy and is logged with the discarded count.
//! - A crashed peer is indistinguishable from a cancellation with
//!   [`Disconnect::Down`]; permanent consumers inherit the exit reason.

mod config;
mod core;
mod error;
mod handle;
mod message;
mod monitor;
mod reason;
mod stage;
mod subscription;

pub mod dispatch;

// ---- Public re-exports ----

pub use config::{
    BufferConfig, BufferKeep, CancelPolicy, Capacity, SubscriptionOptions, DEFAULT_BUFFER_CAPACITY,
    DEFAULT_MAX_DEMAND,
};
pub use crate::core::start;
pub use dispatch::{BroadcastDispatcher, DemandDispatcher, Dispatcher, PartitionDispatcher};
pub use error::{StageError, StartError};
pub use handle::{StageHandle, DEFAULT_TIMEOUT};
pub use reason::{Disconnect, ExitReason};
pub use stage::{Emit, Init, Peer, Replier, Stage, StageSpec, StageType, Subscribed};
pub use subscription::{ProducerRef, StageId, Subscription, SubscriptionId};
