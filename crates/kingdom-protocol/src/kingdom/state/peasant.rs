use super::{announce, bow_down, settle_dial, FreeState, KingdomState, Next, PrinceState};
use crate::kingdom::effect::KingdomEffect;
use crate::kingdom::event::KingdomEvent;
use crate::kingdom::{Census, KingLink, MachineContext, PeasantReason, PendingDial};
use crate::message::admin::AdminMessage;
use crate::runtime::ProtocolEvent;
use crate::types::Role;

/// Member of a kingdom. Listens passively; reports foreign kings upward.
#[derive(Debug, Clone)]
pub struct PeasantState {
    reason: PeasantReason,
    king: Option<KingLink>,
    census: Census,
    /// Set while moving to the prince or to a merge winner.
    dial: Option<PendingDial>,
}

impl PeasantState {
    pub(crate) fn joined(king: KingLink, reason: PeasantReason) -> Self {
        Self {
            reason,
            king: Some(king),
            census: Census::new(),
            dial: None,
        }
    }

    /// A demoted prince keeps its king and what it knew of the census.
    pub(crate) fn demoted(king: Option<KingLink>, census: Census, dial: Option<PendingDial>) -> Self {
        Self {
            reason: PeasantReason::Degradation,
            king,
            census,
            dial,
        }
    }

    pub fn reason(&self) -> PeasantReason {
        self.reason
    }

    pub fn king(&self) -> Option<&KingLink> {
        self.king.as_ref()
    }

    pub fn census(&self) -> &Census {
        &self.census
    }

    pub(crate) fn enter(&mut self, _ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        announce(Role::Peasant, Some(self.reason), fx);
    }

    fn is_king(&self, device: &crate::types::DeviceId) -> bool {
        self.king.as_ref().is_some_and(|k| k.device == *device)
    }

    pub(crate) fn on_event(
        mut self,
        event: KingdomEvent,
        ctx: &mut MachineContext,
        fx: &mut Vec<KingdomEffect>,
    ) -> Next {
        if let Some(outcome) = settle_dial(&self.dial, &event, fx) {
            return match outcome {
                Ok(link) => {
                    let reason = self
                        .dial
                        .as_ref()
                        .map_or(PeasantReason::FollowedHeir, |d| d.reason);
                    Next::Enter(KingdomState::Peasant(PeasantState::joined(link, reason)))
                }
                Err(()) => Next::Enter(KingdomState::Free(FreeState::default())),
            };
        }

        match event {
            KingdomEvent::Admin { from, message } if self.is_king(&from) => match message {
                AdminMessage::Census { census } => {
                    self.census = census.clone();
                    fx.push(KingdomEffect::Emit(ProtocolEvent::CensusUpdated { census }));
                }
                AdminMessage::PronouncePrince { prince } => {
                    if prince == *ctx.local_id() {
                        fx.push(KingdomEffect::SendAdminUpstream(
                            AdminMessage::AckPronouncePrince {
                                prince: prince.clone(),
                                metadata: ctx.local_metadata(),
                            },
                        ));
                        self.census.designate_prince(&prince);
                        return Next::Enter(KingdomState::Prince(PrinceState::pronounced(
                            self.king,
                            self.census,
                        )));
                    }
                    self.census.designate_prince(&prince);
                }
                AdminMessage::BowDownToNewKing { new_king, metadata } => {
                    self.king = None;
                    self.dial = Some(bow_down(new_king, metadata, ctx, fx));
                }
                _ => {}
            },
            KingdomEvent::Discovered(beacon) => {
                let own = beacon.device_id == *ctx.local_id() || self.is_king(&beacon.device_id);
                if !own && self.king.is_some() {
                    fx.push(KingdomEffect::SendAdminUpstream(
                        AdminMessage::DiscoveredDevice { beacon },
                    ));
                }
            }
            KingdomEvent::ConnectionClosed { connection, remote }
                if self.king.as_ref().is_some_and(|k| k.connection == connection) =>
            {
                self.king = None;
                let heir = self
                    .census
                    .prince()
                    .filter(|p| **p != remote && *p != ctx.local_id())
                    .cloned();
                match heir {
                    Some(heir) => {
                        tracing::info!(device = %ctx.local_id(), heir = %heir, "king lost, following the prince");
                        let delay = ctx.config().heir_delay;
                        self.dial = Some(ctx.dial(heir, delay, PeasantReason::FollowedHeir, fx));
                    }
                    None => {
                        tracing::info!(device = %ctx.local_id(), "king lost without an heir");
                        return Next::Enter(KingdomState::Free(FreeState::default()));
                    }
                }
            }
            KingdomEvent::Incoming { connection, .. } => {
                fx.push(KingdomEffect::Reject(connection));
            }
            _ => {}
        }
        Next::Stay(KingdomState::Peasant(self))
    }
}
