use super::{announce, bow_down, settle_dial, FreeState, KingState, KingdomState, Next, PeasantState};
use crate::kingdom::effect::KingdomEffect;
use crate::kingdom::event::KingdomEvent;
use crate::kingdom::{Census, KingLink, MachineContext, PendingDial};
use crate::message::admin::AdminMessage;
use crate::runtime::ProtocolEvent;
use crate::types::Role;

/// Designated heir. Scans actively and reports foreign kings to the king.
#[derive(Debug, Clone)]
pub struct PrinceState {
    king: Option<KingLink>,
    census: Census,
    dial: Option<PendingDial>,
}

impl PrinceState {
    pub(crate) fn pronounced(king: Option<KingLink>, census: Census) -> Self {
        Self {
            king,
            census,
            dial: None,
        }
    }

    pub fn king(&self) -> Option<&KingLink> {
        self.king.as_ref()
    }

    pub fn census(&self) -> &Census {
        &self.census
    }

    pub(crate) fn enter(&mut self, _ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        announce(Role::Prince, None, fx);
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
                Ok(link) => Next::Enter(KingdomState::Peasant(PeasantState::joined(
                    link,
                    crate::kingdom::PeasantReason::BowedDown,
                ))),
                Err(()) => Next::Enter(KingdomState::Free(FreeState::default())),
            };
        }

        match event {
            KingdomEvent::Admin { from, message } if self.is_king(&from) => match message {
                AdminMessage::Census { census } => {
                    self.census = census.clone();
                    fx.push(KingdomEffect::Emit(ProtocolEvent::CensusUpdated { census }));
                }
                AdminMessage::PronouncePrince { prince } if prince != *ctx.local_id() => {
                    tracing::info!(device = %ctx.local_id(), prince = %prince, "another prince pronounced");
                    self.census.designate_prince(&prince);
                    return Next::Enter(KingdomState::Peasant(PeasantState::demoted(
                        self.king, self.census, None,
                    )));
                }
                AdminMessage::PronouncePrince { prince } => {
                    fx.push(KingdomEffect::SendAdminUpstream(
                        AdminMessage::AckPronouncePrince {
                            prince,
                            metadata: ctx.local_metadata(),
                        },
                    ));
                }
                AdminMessage::BowDownToNewKing { new_king, metadata } => {
                    self.king = None;
                    self.dial = Some(bow_down(new_king, metadata, ctx, fx));
                }
                _ => {}
            },
            KingdomEvent::Discovered(beacon) => {
                if beacon.is_king() && !self.is_king(&beacon.device_id) && self.king.is_some() {
                    fx.push(KingdomEffect::SendAdminUpstream(
                        AdminMessage::PrinceFoundAKing {
                            king: beacon.device_id,
                            metadata: beacon.metadata,
                        },
                    ));
                }
            }
            KingdomEvent::ConnectionClosed { connection, .. }
                if self.king.as_ref().is_some_and(|k| k.connection == connection) =>
            {
                tracing::info!(device = %ctx.local_id(), "king lost, prince takes the crown");
                return Next::Enter(KingdomState::King(KingState::new(ctx.local_id().clone())));
            }
            KingdomEvent::Incoming { connection, .. } => {
                fx.push(KingdomEffect::Reject(connection));
            }
            _ => {}
        }
        Next::Stay(KingdomState::Prince(self))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use kingdom_transport::ConnectionId;

    fn prince_of(local: &str, king: &str) -> (KingdomState, MachineContext, ConnectionId) {
        let mut ctx = ctx(local);
        let (state, _) = KingdomState::initial(&mut ctx);
        let (state, fx) = state.handle(king_beacon(king), &mut ctx);
        let (ticket, _) = dial_ticket(&fx).unwrap();
        let conn = conn_id();
        let (state, _) = state.handle(
            KingdomEvent::DialSucceeded {
                ticket,
                connection: conn,
                remote: id(king),
            },
            &mut ctx,
        );
        let (state, _) = state.handle(
            KingdomEvent::Admin {
                from: id(king),
                message: AdminMessage::PronouncePrince { prince: id(local) },
            },
            &mut ctx,
        );
        assert_eq!(state.role(), Role::Prince);
        (state, ctx, conn)
    }

    #[test]
    fn prince_reports_foreign_king() {
        let (state, mut ctx, _) = prince_of("p", "k");
        let (state, fx) = state.handle(king_beacon("q"), &mut ctx);
        assert_eq!(state.role(), Role::Prince);
        assert!(has_effect(&fx, |e| matches!(
            e,
            KingdomEffect::SendAdminUpstream(AdminMessage::PrinceFoundAKing { king, .. }) if *king == id("q")
        )));
    }

    #[test]
    fn another_pronouncement_demotes() {
        let (state, mut ctx, _) = prince_of("p", "k");
        let (state, _) = state.handle(
            KingdomEvent::Admin {
                from: id("k"),
                message: AdminMessage::PronouncePrince { prince: id("z") },
            },
            &mut ctx,
        );
        match state {
            KingdomState::Peasant(p) => {
                assert_eq!(p.reason(), crate::kingdom::PeasantReason::Degradation);
                assert_eq!(p.king().unwrap().device, id("k"));
            }
            other => panic!("expected peasant, got {:?}", other.role()),
        }
    }

    #[test]
    fn repeated_pronouncement_is_acknowledged_again() {
        let (state, mut ctx, _) = prince_of("p", "k");
        let (state, fx) = state.handle(
            KingdomEvent::Admin {
                from: id("k"),
                message: AdminMessage::PronouncePrince { prince: id("p") },
            },
            &mut ctx,
        );
        assert_eq!(state.role(), Role::Prince);
        assert!(has_effect(&fx, |e| matches!(
            e,
            KingdomEffect::SendAdminUpstream(AdminMessage::AckPronouncePrince { .. })
        )));
    }

    #[test]
    fn king_loss_crowns_the_prince() {
        let (state, mut ctx, conn) = prince_of("p", "k");
        let (state, fx) = state.handle(
            KingdomEvent::ConnectionClosed {
                connection: conn,
                remote: id("k"),
            },
            &mut ctx,
        );
        assert_eq!(state.role(), Role::King);
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::SetMaster(true))));
        let census = state.census();
        assert_eq!(census.king(), Some(&id("p")));
        assert_eq!(census.member_count(), 0);
    }

    #[test]
    fn bow_down_then_failure_goes_free() {
        let (state, mut ctx, _) = prince_of("p", "k");
        let (state, fx) = state.handle(
            KingdomEvent::Admin {
                from: id("k"),
                message: AdminMessage::BowDownToNewKing {
                    new_king: id("z"),
                    metadata: vec![],
                },
            },
            &mut ctx,
        );
        let (ticket, target) = dial_ticket(&fx).unwrap();
        assert_eq!(target, id("z"));
        let (state, _) = state.handle(KingdomEvent::DialFailed { ticket, target }, &mut ctx);
        assert_eq!(state.role(), Role::Free);
    }
}
