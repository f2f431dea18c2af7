//! Courier Broker - destination registry, durable storage, and dispatch
//!
//! This crate is the core of the Courier message broker: a process-wide
//! [`exchange::Exchange`] owns queue and topic destinations, routes
//! inbound messages into per-destination durable logs backed by a SQL
//! store, and drives a pool of dispatch workers that push ready
//! messages to consumers.
//!
//! # Architecture
//!
//! - **Storage**: a connection pool over the configured SQL backend
//!   with named per-session transactions.
//! - **Destinations**: queues deliver each message to one competing
//!   consumer; topics fan out to every matching subscription; browser
//!   subscriptions iterate the log without consuming.
//! - **Selectors**: SQL-92-style predicates over message properties
//!   with three-valued logic; UNKNOWN never matches.
//! - **Dispatch**: a fixed worker pool drains a lock-free queue of
//!   destination keys, with a periodic full sweep as the liveness
//!   backstop.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_broker::{ClientSession, CreationMode, Exchange, Message, StoragePool};
//!
//! let store = Arc::new(StoragePool::connect(&config.storage).await?);
//! let exchange = Exchange::new(config, store).await?;
//! exchange.start().await;
//!
//! exchange.destination("queue://orders", CreationMode::Create).await?;
//! exchange.save_message(&session, &Message::new("m-1", "queue://orders")).await?;
//! ```

pub mod destination;
pub mod exchange;
pub mod message;
pub mod selector;
pub mod session;
pub mod storage;
pub mod uri;

pub use destination::{
    Destination, DestinationInfo, DestinationOwner, Sender, SenderRequest, SubscribeRequest,
    Subscription, SubscriptionMode,
};
pub use exchange::{CreationMode, Exchange};
pub use message::{Delivery, Message, Properties, PropertyValue};
pub use selector::{Selector, SelectorError, Value};
pub use session::ClientSession;
pub use storage::{StoragePool, StorageSession};
pub use uri::{main_destination_path, DestinationKind, DestinationUri};
