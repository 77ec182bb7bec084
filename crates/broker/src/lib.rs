//! Broker and result store ports (mechanics only).
//!
//! The queue substrate and the key-value store are external collaborators.
//! This crate defines the interfaces the rest of the system talks to, plus
//! in-memory implementations for development and tests. Infrastructure-backed
//! implementations (Redis) live in `conveyor-infra`.

pub mod broker;
pub mod in_memory_broker;
pub mod in_memory_store;
pub mod store;

pub use broker::{AckHandle, Broker, BrokerError, Delivery};
pub use in_memory_broker::{DeadLetter, InMemoryBroker};
pub use in_memory_store::InMemoryResultStore;
pub use store::{ResultStore, StoreError};
