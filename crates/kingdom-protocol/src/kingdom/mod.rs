//! Kingdom election: who is king, who follows whom.
//!
//! Pure logic: the machine consumes [`KingdomEvent`]s one at a time and
//! answers with [`KingdomEffect`]s. No I/O, no clocks; timers and dials
//! are requested as effects and come back as events tagged with a
//! [`Ticket`]. The runtime owns the only instance and executes its output.
//!
//! Election policy:
//! - A Free device that overhears a king joins it.
//! - A Free device crowns itself after `free_timeout`, deferring a bounded
//!   number of rounds while it hears a Free device with a greater id.
//! - Two kings that meet merge; the greater id wins.
//! - The king pronounces its greatest member prince; when the king
//!   disappears the prince takes over and everyone else follows it.

pub mod census;
pub mod effect;
pub mod event;
mod state;

pub use census::Census;
pub use effect::KingdomEffect;
pub use event::{KingdomEvent, Ticket, TimerKind};
pub use state::{FreeState, KingState, KingdomState, PeasantState, PrinceState};

use std::fmt;
use std::time::Duration;

use kingdom_transport::{ConnectionId, ConnectionMetadata};

use crate::discovery::BeaconStore;
use crate::types::{DeviceId, Role};

// ── Configuration ────────────────────────────────────────────────────

/// Election timing.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a Free device waits for a king before crowning itself.
    pub free_timeout: Duration,
    /// Crown rounds a Free device skips while a greater Free id is around.
    pub max_defer_rounds: u32,
    /// Peasants wait this long before following the prince, so the prince
    /// has time to crown itself.
    pub heir_delay: Duration,
    /// How often the king re-checks its prince.
    pub prince_review_interval: Duration,
    /// A king alone this long reverts to Free. `None` keeps it king.
    pub king_idle_timeout: Option<Duration>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            free_timeout: Duration::from_secs(3),
            max_defer_rounds: 2,
            heir_delay: Duration::from_millis(500),
            prince_review_interval: Duration::from_secs(5),
            king_idle_timeout: None,
        }
    }
}

// ── Peasant reason ───────────────────────────────────────────────────

/// Why a device became (or stayed) a peasant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeasantReason {
    /// Joined a king it discovered while Free.
    Voluntarily,
    /// Followed the prince after the king vanished.
    FollowedHeir,
    /// Its king lost a merge and told it to move.
    BowedDown,
    /// Was prince, another member got pronounced.
    Degradation,
}

impl fmt::Display for PeasantReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Voluntarily => "voluntarily",
            Self::FollowedHeir => "followed heir",
            Self::BowedDown => "bowed down",
            Self::Degradation => "degradation",
        };
        f.write_str(s)
    }
}

// ── Context ──────────────────────────────────────────────────────────

/// A dial the current state is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDial {
    pub ticket: Ticket,
    pub target: DeviceId,
    /// Reason recorded once the dial lands and we become a peasant.
    pub reason: PeasantReason,
}

/// The live connection to our king.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KingLink {
    pub device: DeviceId,
    pub connection: ConnectionId,
}

/// Everything the states share: identity, config, beacons, tickets.
#[derive(Debug)]
pub struct MachineContext {
    local_id: DeviceId,
    metadata: Vec<ConnectionMetadata>,
    config: ElectionConfig,
    beacons: BeaconStore,
    next_ticket: Ticket,
}

impl MachineContext {
    pub fn new(
        local_id: DeviceId,
        metadata: Vec<ConnectionMetadata>,
        config: ElectionConfig,
        beacons: BeaconStore,
    ) -> Self {
        Self {
            local_id,
            metadata,
            config,
            beacons,
            next_ticket: 0,
        }
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn beacons(&self) -> &BeaconStore {
        &self.beacons
    }

    pub(crate) fn local_metadata(&self) -> Vec<ConnectionMetadata> {
        self.metadata.clone()
    }

    fn ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Request a dial; metadata comes from the beacon store.
    pub(crate) fn dial(
        &mut self,
        target: DeviceId,
        delay: Duration,
        reason: PeasantReason,
        fx: &mut Vec<KingdomEffect>,
    ) -> PendingDial {
        let ticket = self.ticket();
        let metadata = self.beacons.get(&target).unwrap_or_default();
        tracing::debug!(device = %self.local_id, target = %target, ticket, "dial requested");
        fx.push(KingdomEffect::Dial {
            ticket,
            target: target.clone(),
            metadata,
            delay,
        });
        PendingDial {
            ticket,
            target,
            reason,
        }
    }

    pub(crate) fn start_timer(
        &mut self,
        timer: TimerKind,
        after: Duration,
        fx: &mut Vec<KingdomEffect>,
    ) -> Ticket {
        let ticket = self.ticket();
        fx.push(KingdomEffect::StartTimer {
            ticket,
            timer,
            after,
        });
        ticket
    }
}

// ── Machine ──────────────────────────────────────────────────────────

/// Owns the current [`KingdomState`] and its [`MachineContext`].
pub struct KingdomMachine {
    ctx: MachineContext,
    state: KingdomState,
}

impl KingdomMachine {
    /// A machine in Free plus the effects of entering it.
    pub fn start(ctx: MachineContext) -> (Self, Vec<KingdomEffect>) {
        let mut ctx = ctx;
        let (state, effects) = KingdomState::initial(&mut ctx);
        (Self { ctx, state }, effects)
    }

    pub fn handle(&mut self, event: KingdomEvent) -> Vec<KingdomEffect> {
        let state = std::mem::replace(&mut self.state, KingdomState::placeholder());
        let (next, effects) = state.handle(event, &mut self.ctx);
        self.state = next;
        effects
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn state(&self) -> &KingdomState {
        &self.state
    }

    /// The census as this device knows it.
    pub fn census(&self) -> Census {
        self.state.census()
    }

    pub fn context(&self) -> &MachineContext {
        &self.ctx
    }
}
