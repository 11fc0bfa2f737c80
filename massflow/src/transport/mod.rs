//! Message transport between stages.
//!
//! This module provides:
//! - Bounded FIFO channels with blocking and async endpoints
//! - Channel addresses and the registry that binds them
//! - Relays that decouple a stage's queue from its replicas

mod channel;
mod registry;
mod relay;

pub use channel::{channel, Message, PullSocket, PushSocket};
pub use registry::{Address, AddressAllocator, ChannelPair, ChannelRegistry};
pub use relay::{Relay, RelayStats, BACKEND_CAPACITY};
