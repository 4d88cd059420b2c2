//! Kingdom protocol layer.
//!
//! Self-organizes nearby devices into one kingdom with a single king and
//! gives it prioritized publish/subscribe channels, on top of
//! `kingdom-transport` connections.
//!
//! Wire format: hand-packed frame header (big-endian) with MessagePack
//! admin bodies.
//! Election: greatest device id wins every merge.

pub mod channel;
pub mod discovery;
pub mod error;
pub mod kingdom;
pub mod link;
pub mod message;
pub mod runtime;
pub mod types;

pub use channel::{
    Channel, ChannelConfig, ChannelManager, ChannelSubscription, ManagerEvent, PickPolicy,
};
pub use discovery::{Beacon, BeaconStore, Discovery, MemoryAirwaves, MemoryRadio, NoDiscovery};
pub use error::KingdomError;
pub use kingdom::{
    Census, ElectionConfig, KingdomEffect, KingdomEvent, KingdomMachine, KingdomState,
    MachineContext, PeasantReason, Ticket, TimerKind,
};
pub use link::{ConnectionRecord, LinkConfig, MessageReceiver, MessageSender};
pub use message::admin::AdminMessage;
pub use message::chunk::Reassembler;
pub use message::{Message, MessageKind};
pub use runtime::{
    KingdomRuntime, ProtocolEvent, RuntimeChannels, RuntimeCommand, RuntimeConfig, RuntimeHandle,
    RuntimeParts,
};
pub use types::{ChannelId, DeviceId, Priority, Role, PROTOCOL_VERSION};
