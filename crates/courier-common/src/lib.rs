//! # courier-common
//!
//! Shared types for the Courier message broker:
//! - `courier-broker`: destination registry, durable storage, dispatch

pub mod config;
pub mod error;

pub use config::{
    load_broker_config, load_config, BrokerConfig, BrokerSection, ConnectionConfig, DbmsType,
    StorageConfig, ThreadsConfig,
};
pub use error::{BrokerError, BrokerResult, ErrorKind};
