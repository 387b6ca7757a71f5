//! Beacon Store - Telemetry storage with a primary and a fallback engine
//!
//! [`StorageCoordinator`] is the entry point. It selects the SQLite engine
//! (running in its own worker behind a retrying message channel) when that
//! engine initializes, and an in-process key-value engine otherwise.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod primary;
pub mod pruner;

pub use channel::{ChannelFault, RetryPolicy, RetryingChannel, Transport};
pub use config::*;
pub use coordinator::StorageCoordinator;
pub use engine::StoreEngine;
pub use error::*;
pub use fallback::FallbackEngine;
pub use primary::PrimaryEngine;
pub use pruner::{EntityLimits, PrunerHandle, RetentionPolicy, RetentionPruner};

pub use beacon_types as types;
