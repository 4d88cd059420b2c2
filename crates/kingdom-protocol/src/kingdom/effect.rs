use std::time::Duration;

use kingdom_transport::{ConnectionId, ConnectionMetadata, DeviceId};

use super::event::{Ticket, TimerKind};
use crate::message::admin::AdminMessage;
use crate::runtime::ProtocolEvent;
use crate::types::Role;

/// Intent produced by the pure transition logic.
///
/// Every handler returns `Vec<KingdomEffect>`; the runtime executor then
/// carries them out in order against the channel manager, the dialer and
/// discovery.
#[derive(Debug, Clone)]
pub enum KingdomEffect {
    /// Switch the channel manager between master and client.
    SetMaster(bool),
    /// Active discovery on or off.
    SetDiscovery(bool),
    /// Advertise a new local role.
    AnnounceRole(Role),
    /// Hand a waiting connection to the channel manager.
    Adopt(ConnectionId),
    /// Close a waiting connection.
    Reject(ConnectionId),
    /// Dial `target`, retrying a bounded number of times; the outcome
    /// comes back as `DialSucceeded`/`DialFailed` with this ticket.
    Dial {
        ticket: Ticket,
        target: DeviceId,
        metadata: Vec<ConnectionMetadata>,
        delay: Duration,
    },
    /// Drop the connection to one device.
    Disconnect(DeviceId),
    /// Drop every remote connection, optionally flushing queued messages.
    DisconnectAll { flush: bool },
    SendAdmin { to: DeviceId, message: AdminMessage },
    SendAdminUpstream(AdminMessage),
    BroadcastAdmin(AdminMessage),
    StartTimer {
        ticket: Ticket,
        timer: TimerKind,
        after: Duration,
    },
    /// Report to the application.
    Emit(ProtocolEvent),
}
