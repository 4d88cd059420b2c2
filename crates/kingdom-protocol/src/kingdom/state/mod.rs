//! The four election states.
//!
//! Each state consumes an event and either stays (possibly mutated) or
//! hands back a successor. Entering a successor runs its `enter` hook,
//! which announces the role and arms timers.

mod free;
mod king;
mod peasant;
mod prince;

pub use free::FreeState;
pub use king::KingState;
pub use peasant::PeasantState;
pub use prince::PrinceState;

use kingdom_transport::ConnectionMetadata;

use super::effect::KingdomEffect;
use super::event::KingdomEvent;
use super::{Census, KingLink, MachineContext, PeasantReason, PendingDial};
use crate::runtime::ProtocolEvent;
use crate::types::{DeviceId, Role};

#[derive(Debug, Clone)]
pub enum KingdomState {
    Free(FreeState),
    Peasant(PeasantState),
    Prince(PrinceState),
    King(KingState),
}

/// What a state handler decided.
pub(crate) enum Next {
    Stay(KingdomState),
    Enter(KingdomState),
}

impl KingdomState {
    pub(crate) fn initial(ctx: &mut MachineContext) -> (Self, Vec<KingdomEffect>) {
        let mut fx = Vec::new();
        let mut state = KingdomState::Free(FreeState::default());
        state.enter(ctx, &mut fx);
        (state, fx)
    }

    pub(crate) fn placeholder() -> Self {
        KingdomState::Free(FreeState::default())
    }

    /// Apply one event.
    pub fn handle(
        self,
        event: KingdomEvent,
        ctx: &mut MachineContext,
    ) -> (KingdomState, Vec<KingdomEffect>) {
        let mut fx = Vec::new();

        if let KingdomEvent::Discovered(beacon) = &event {
            if beacon.device_id == *ctx.local_id() {
                return (self, fx);
            }
            ctx.beacons()
                .put(beacon.device_id.clone(), beacon.metadata.clone());
        }

        let next = match self {
            KingdomState::Free(s) => s.on_event(event, ctx, &mut fx),
            KingdomState::Peasant(s) => s.on_event(event, ctx, &mut fx),
            KingdomState::Prince(s) => s.on_event(event, ctx, &mut fx),
            KingdomState::King(s) => s.on_event(event, ctx, &mut fx),
        };
        let state = match next {
            Next::Stay(state) => state,
            Next::Enter(mut state) => {
                tracing::info!(device = %ctx.local_id(), role = %state.role(), "role transition");
                state.enter(ctx, &mut fx);
                state
            }
        };
        (state, fx)
    }

    fn enter(&mut self, ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        match self {
            KingdomState::Free(s) => s.enter(ctx, fx),
            KingdomState::Peasant(s) => s.enter(ctx, fx),
            KingdomState::Prince(s) => s.enter(ctx, fx),
            KingdomState::King(s) => s.enter(ctx, fx),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            KingdomState::Free(_) => Role::Free,
            KingdomState::Peasant(_) => Role::Peasant,
            KingdomState::Prince(_) => Role::Prince,
            KingdomState::King(_) => Role::King,
        }
    }

    pub fn census(&self) -> Census {
        match self {
            KingdomState::Free(_) => Census::new(),
            KingdomState::Peasant(s) => s.census().clone(),
            KingdomState::Prince(s) => s.census().clone(),
            KingdomState::King(s) => s.census().clone(),
        }
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

/// Role-change bookkeeping every `enter` performs.
pub(crate) fn announce(
    role: Role,
    reason: Option<PeasantReason>,
    fx: &mut Vec<KingdomEffect>,
) {
    fx.push(KingdomEffect::SetDiscovery(role.scans_actively()));
    fx.push(KingdomEffect::AnnounceRole(role));
    fx.push(KingdomEffect::Emit(ProtocolEvent::RoleChanged { role, reason }));
}

/// Leave the current kingdom and dial `new_king`.
pub(crate) fn bow_down(
    new_king: DeviceId,
    metadata: Vec<ConnectionMetadata>,
    ctx: &mut MachineContext,
    fx: &mut Vec<KingdomEffect>,
) -> PendingDial {
    tracing::info!(device = %ctx.local_id(), new_king = %new_king, "bowing down");
    fx.push(KingdomEffect::Emit(ProtocolEvent::KingdomMerging {
        winner: new_king.clone(),
    }));
    fx.push(KingdomEffect::DisconnectAll { flush: false });
    ctx.beacons().put(new_king.clone(), metadata);
    ctx.dial(new_king, std::time::Duration::ZERO, PeasantReason::BowedDown, fx)
}

/// Settle a dial result against the dial we are waiting on.
///
/// `Some(Ok(_))` on success (connection already adopted), `Some(Err(()))`
/// on failure, `None` if the event is not about our dial.
pub(crate) fn settle_dial(
    pending: &Option<PendingDial>,
    event: &KingdomEvent,
    fx: &mut Vec<KingdomEffect>,
) -> Option<Result<KingLink, ()>> {
    let pending = pending.as_ref()?;
    match event {
        KingdomEvent::DialSucceeded {
            ticket,
            connection,
            remote,
        } if *ticket == pending.ticket => {
            fx.push(KingdomEffect::Adopt(*connection));
            Some(Ok(KingLink {
                device: remote.clone(),
                connection: *connection,
            }))
        }
        KingdomEvent::DialFailed { ticket, target } if *ticket == pending.ticket => {
            tracing::info!(target = %target, "dial exhausted its attempts");
            Some(Err(()))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::discovery::{Beacon, BeaconStore};
    use crate::kingdom::{ElectionConfig, Ticket};
    use kingdom_transport::ConnectionId;

    pub fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    pub fn ctx(local: &str) -> MachineContext {
        MachineContext::new(
            id(local),
            vec![ConnectionMetadata::memory(&id(local))],
            ElectionConfig::default(),
            BeaconStore::new(),
        )
    }

    pub fn king_beacon(s: &str) -> KingdomEvent {
        KingdomEvent::Discovered(Beacon::new(
            id(s),
            Role::King,
            vec![ConnectionMetadata::memory(&id(s))],
        ))
    }

    pub fn dial_ticket(fx: &[KingdomEffect]) -> Option<(Ticket, DeviceId)> {
        fx.iter().find_map(|e| match e {
            KingdomEffect::Dial { ticket, target, .. } => Some((*ticket, target.clone())),
            _ => None,
        })
    }

    pub fn timer_ticket(fx: &[KingdomEffect], kind: crate::kingdom::TimerKind) -> Option<Ticket> {
        fx.iter().find_map(|e| match e {
            KingdomEffect::StartTimer { ticket, timer, .. } if *timer == kind => Some(*ticket),
            _ => None,
        })
    }

    pub fn has_effect(fx: &[KingdomEffect], f: impl Fn(&KingdomEffect) -> bool) -> bool {
        fx.iter().any(f)
    }

    /// Connection ids are process-global; take one from a real pipe.
    pub fn conn_id() -> ConnectionId {
        kingdom_transport::Connection::loopback(id("x"), 16).id()
    }
}
