//! Dynamically load-balanced distributed work lists.
//!
//! A group of ranks each keeps a local list of work items. A rank whose list
//! runs dry auctions for work among its peers and receives part of the most
//! suitable donor's list; once no rank has work left the group agrees on
//! termination. See [`Dlml`] for the application-facing API.

pub mod apps;
pub mod bridge;
pub mod codec;
pub mod collective;
pub mod config;
pub mod dlml;
pub mod engine;
pub mod error;
pub mod queue;
pub mod shutdown;
pub mod strategy;
pub mod transport;

pub use codec::{Codec, JsonCodec};
pub use config::{BalanceConfig, GroupConfig};
pub use dlml::Dlml;
pub use engine::WorkItem;
pub use error::{DlmlError, Result};
pub use strategy::StrategyType;
