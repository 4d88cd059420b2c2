use super::{announce, settle_dial, KingdomState, Next};
use crate::kingdom::effect::KingdomEffect;
use crate::kingdom::event::{KingdomEvent, Ticket, TimerKind};
use crate::kingdom::{MachineContext, PeasantReason, PendingDial};
use crate::types::Role;

use super::{KingState, PeasantState};

/// No kingdom yet: scanning, waiting to join or to crown.
#[derive(Debug, Clone, Default)]
pub struct FreeState {
    crown: Option<Ticket>,
    deferrals: u32,
    greater_free_seen: bool,
    dial: Option<PendingDial>,
}

impl FreeState {
    pub(crate) fn enter(&mut self, ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        fx.push(KingdomEffect::DisconnectAll { flush: false });
        fx.push(KingdomEffect::SetMaster(false));
        announce(Role::Free, None, fx);
        self.arm_crown(ctx, fx);
    }

    fn arm_crown(&mut self, ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        let after = ctx.config().free_timeout;
        self.crown = Some(ctx.start_timer(TimerKind::Crown, after, fx));
    }

    pub fn is_dialing(&self) -> bool {
        self.dial.is_some()
    }

    pub(crate) fn on_event(
        mut self,
        event: KingdomEvent,
        ctx: &mut MachineContext,
        fx: &mut Vec<KingdomEffect>,
    ) -> Next {
        if let Some(outcome) = settle_dial(&self.dial, &event, fx) {
            return match outcome {
                Ok(link) => Next::Enter(KingdomState::Peasant(PeasantState::joined(
                    link,
                    PeasantReason::Voluntarily,
                ))),
                Err(()) => {
                    self.dial = None;
                    Next::Stay(KingdomState::Free(self))
                }
            };
        }

        match event {
            KingdomEvent::Discovered(beacon) => {
                if beacon.is_king() {
                    if self.dial.is_none() {
                        self.dial = Some(ctx.dial(
                            beacon.device_id,
                            std::time::Duration::ZERO,
                            PeasantReason::Voluntarily,
                            fx,
                        ));
                    }
                } else if beacon.role == Role::Free && beacon.device_id > *ctx.local_id() {
                    self.greater_free_seen = true;
                }
            }
            KingdomEvent::Timeout {
                ticket,
                timer: TimerKind::Crown,
            } if self.crown == Some(ticket) => {
                if self.dial.is_some() {
                    // Joining is in progress; look again later.
                    self.arm_crown(ctx, fx);
                } else if self.greater_free_seen
                    && self.deferrals < ctx.config().max_defer_rounds
                {
                    self.deferrals += 1;
                    self.greater_free_seen = false;
                    tracing::debug!(device = %ctx.local_id(), round = self.deferrals, "deferring crown to a greater free device");
                    self.arm_crown(ctx, fx);
                } else {
                    return Next::Enter(KingdomState::King(KingState::new(ctx.local_id().clone())));
                }
            }
            KingdomEvent::Incoming { connection, remote } => {
                tracing::debug!(remote = %remote, "free device rejects incoming connection");
                fx.push(KingdomEffect::Reject(connection));
            }
            _ => {}
        }
        Next::Stay(KingdomState::Free(self))
    }
}
