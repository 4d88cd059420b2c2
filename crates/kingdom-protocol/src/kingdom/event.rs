use kingdom_transport::{ConnectionId, DeviceId};

use crate::discovery::Beacon;
use crate::message::admin::AdminMessage;

/// Correlates a dial or timer with the state that asked for it.
///
/// Results carrying a ticket the current state does not hold belong to a
/// superseded state and are ignored.
pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// A Free device gives up waiting for a king.
    Crown,
    /// The king checks whether a prince must be (re)pronounced.
    PrinceReview,
    /// A king without members reverts to Free.
    Idle,
}

/// Everything the state machine reacts to, in one ordered stream.
#[derive(Debug, Clone)]
pub enum KingdomEvent {
    /// Discovery overheard a device.
    Discovered(Beacon),
    /// A device connected to us. The connection waits for Adopt/Reject.
    Incoming {
        connection: ConnectionId,
        remote: DeviceId,
    },
    DialSucceeded {
        ticket: Ticket,
        connection: ConnectionId,
        remote: DeviceId,
    },
    /// All attempts failed.
    DialFailed {
        ticket: Ticket,
        target: DeviceId,
    },
    ConnectionClosed {
        connection: ConnectionId,
        remote: DeviceId,
    },
    Admin {
        from: DeviceId,
        message: AdminMessage,
    },
    Timeout {
        ticket: Ticket,
        timer: TimerKind,
    },
}
