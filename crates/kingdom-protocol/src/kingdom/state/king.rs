use std::collections::HashMap;

use kingdom_transport::{ConnectionId, ConnectionMetadata};

use super::{announce, settle_dial, FreeState, KingdomState, Next, PeasantState};
use crate::kingdom::effect::KingdomEffect;
use crate::kingdom::event::{KingdomEvent, Ticket, TimerKind};
use crate::kingdom::{Census, MachineContext, PeasantReason, PendingDial};
use crate::message::admin::AdminMessage;
use crate::runtime::ProtocolEvent;
use crate::types::{DeviceId, Role};

/// Master of a kingdom: accepts members, keeps the census, names a prince.
#[derive(Debug, Clone)]
pub struct KingState {
    census: Census,
    members: HashMap<DeviceId, ConnectionId>,
    /// Pronounced but not necessarily acknowledged yet.
    pronounced: Option<DeviceId>,
    review: Option<Ticket>,
    idle: Option<Ticket>,
    /// Set once we lost a merge and are dialing the winner.
    abdication: Option<PendingDial>,
}

impl KingState {
    pub(crate) fn new(local: DeviceId) -> Self {
        Self {
            census: Census::crowned(local),
            members: HashMap::new(),
            pronounced: None,
            review: None,
            idle: None,
            abdication: None,
        }
    }

    pub fn census(&self) -> &Census {
        &self.census
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_abdicating(&self) -> bool {
        self.abdication.is_some()
    }

    pub(crate) fn enter(&mut self, ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        fx.push(KingdomEffect::SetMaster(true));
        announce(Role::King, None, fx);
        fx.push(KingdomEffect::Emit(ProtocolEvent::CensusUpdated {
            census: self.census.clone(),
        }));
        let every = ctx.config().prince_review_interval;
        self.review = Some(ctx.start_timer(TimerKind::PrinceReview, every, fx));
        self.arm_idle(ctx, fx);
    }

    fn arm_idle(&mut self, ctx: &mut MachineContext, fx: &mut Vec<KingdomEffect>) {
        if !self.members.is_empty() {
            return;
        }
        if let Some(after) = ctx.config().king_idle_timeout {
            self.idle = Some(ctx.start_timer(TimerKind::Idle, after, fx));
        }
    }

    fn broadcast_census(&self, fx: &mut Vec<KingdomEffect>) {
        fx.push(KingdomEffect::BroadcastAdmin(AdminMessage::Census {
            census: self.census.clone(),
        }));
        fx.push(KingdomEffect::Emit(ProtocolEvent::CensusUpdated {
            census: self.census.clone(),
        }));
    }

    /// Pronounce the greatest member if nobody holds the title.
    fn review_prince(&mut self, fx: &mut Vec<KingdomEffect>) {
        let current = self
            .pronounced
            .as_ref()
            .filter(|p| self.members.contains_key(*p));
        if let Some(prince) = current {
            if self.census.role_of(prince) != Some(Role::Prince) {
                // Not acknowledged yet; ask again.
                fx.push(KingdomEffect::SendAdmin {
                    to: prince.clone(),
                    message: AdminMessage::PronouncePrince {
                        prince: prince.clone(),
                    },
                });
            }
            return;
        }
        self.pronounced = self.census.heir_candidate().cloned();
        if let Some(prince) = &self.pronounced {
            tracing::info!(prince = %prince, "pronouncing prince");
            fx.push(KingdomEffect::BroadcastAdmin(AdminMessage::PronouncePrince {
                prince: prince.clone(),
            }));
        }
    }

    /// Another king is around. The greater id wins; we only act if we lose.
    fn consider_rival(
        &mut self,
        rival: DeviceId,
        metadata: Vec<ConnectionMetadata>,
        ctx: &mut MachineContext,
        fx: &mut Vec<KingdomEffect>,
    ) {
        if self.abdication.is_some() || rival == *ctx.local_id() {
            return;
        }
        if rival < *ctx.local_id() {
            tracing::debug!(rival = %rival, "lesser king ignored");
            return;
        }
        tracing::info!(device = %ctx.local_id(), winner = %rival, "kingdom merge lost, abdicating");
        fx.push(KingdomEffect::Emit(ProtocolEvent::KingdomMerging {
            winner: rival.clone(),
        }));
        ctx.beacons().put(rival.clone(), metadata.clone());
        fx.push(KingdomEffect::BroadcastAdmin(AdminMessage::BowDownToNewKing {
            new_king: rival.clone(),
            metadata,
        }));
        fx.push(KingdomEffect::DisconnectAll { flush: true });
        fx.push(KingdomEffect::SetMaster(false));
        self.abdication = Some(ctx.dial(rival, std::time::Duration::ZERO, PeasantReason::BowedDown, fx));
    }

    pub(crate) fn on_event(
        mut self,
        event: KingdomEvent,
        ctx: &mut MachineContext,
        fx: &mut Vec<KingdomEffect>,
    ) -> Next {
        if let Some(outcome) = settle_dial(&self.abdication, &event, fx) {
            return match outcome {
                Ok(link) => Next::Enter(KingdomState::Peasant(PeasantState::joined(
                    link,
                    PeasantReason::BowedDown,
                ))),
                Err(()) => Next::Enter(KingdomState::Free(FreeState::default())),
            };
        }

        match event {
            KingdomEvent::Incoming { connection, remote } => {
                if self.abdication.is_some() {
                    fx.push(KingdomEffect::Reject(connection));
                    return Next::Stay(KingdomState::King(self));
                }
                if self.members.contains_key(&remote) {
                    fx.push(KingdomEffect::Disconnect(remote.clone()));
                }
                fx.push(KingdomEffect::Adopt(connection));
                self.members.insert(remote.clone(), connection);
                if self.census.role_of(&remote).is_none() {
                    self.census.insert(remote.clone(), Role::Peasant);
                }
                self.idle = None;
                tracing::info!(member = %remote, members = self.members.len(), "member joined");
                fx.push(KingdomEffect::Emit(ProtocolEvent::MemberJoined { device: remote }));
                self.review_prince(fx);
                self.broadcast_census(fx);
            }
            KingdomEvent::ConnectionClosed { connection, remote } => {
                if self.abdication.is_some() || self.members.get(&remote) != Some(&connection) {
                    return Next::Stay(KingdomState::King(self));
                }
                self.members.remove(&remote);
                self.census.remove(&remote);
                if self.pronounced.as_ref() == Some(&remote) {
                    self.pronounced = None;
                }
                tracing::info!(member = %remote, members = self.members.len(), "member left");
                fx.push(KingdomEffect::Emit(ProtocolEvent::MemberLeft { device: remote }));
                self.review_prince(fx);
                self.broadcast_census(fx);
                self.arm_idle(ctx, fx);
            }
            KingdomEvent::Admin { from, message } => match message {
                AdminMessage::AckPronouncePrince { prince, metadata }
                    if from == prince
                        && self.pronounced.as_ref() == Some(&prince)
                        && self.members.contains_key(&prince) =>
                {
                    ctx.beacons().put(prince.clone(), metadata);
                    if self.census.role_of(&prince) != Some(Role::Prince) {
                        self.census.designate_prince(&prince);
                        fx.push(KingdomEffect::Emit(ProtocolEvent::PrincePronounced {
                            prince,
                        }));
                        self.broadcast_census(fx);
                    }
                }
                AdminMessage::PrinceFoundAKing { king, metadata }
                    if self.members.contains_key(&from) =>
                {
                    self.consider_rival(king, metadata, ctx, fx);
                }
                AdminMessage::DiscoveredDevice { beacon } if self.members.contains_key(&from) => {
                    if beacon.device_id == *ctx.local_id() {
                        return Next::Stay(KingdomState::King(self));
                    }
                    ctx.beacons().put(beacon.device_id.clone(), beacon.metadata.clone());
                    if beacon.is_king() {
                        self.consider_rival(beacon.device_id, beacon.metadata, ctx, fx);
                    }
                }
                _ => {}
            },
            KingdomEvent::Discovered(beacon) => {
                if beacon.is_king() {
                    self.consider_rival(beacon.device_id, beacon.metadata, ctx, fx);
                }
            }
            KingdomEvent::Timeout {
                ticket,
                timer: TimerKind::PrinceReview,
            } if self.review == Some(ticket) => {
                if self.abdication.is_none() {
                    self.review_prince(fx);
                    let every = ctx.config().prince_review_interval;
                    self.review = Some(ctx.start_timer(TimerKind::PrinceReview, every, fx));
                }
            }
            KingdomEvent::Timeout {
                ticket,
                timer: TimerKind::Idle,
            } if self.idle == Some(ticket) => {
                if self.members.is_empty() && self.abdication.is_none() {
                    tracing::info!(device = %ctx.local_id(), "idle king steps down");
                    return Next::Enter(KingdomState::Free(FreeState::default()));
                }
            }
            _ => {}
        }
        Next::Stay(KingdomState::King(self))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::discovery::Beacon;
    use crate::kingdom::ElectionConfig;

    fn crowned(local: &str) -> (KingdomState, MachineContext) {
        let mut ctx = ctx(local);
        let (state, fx) = KingdomState::initial(&mut ctx);
        let ticket = timer_ticket(&fx, TimerKind::Crown).unwrap();
        let (state, _) = state.handle(
            KingdomEvent::Timeout {
                ticket,
                timer: TimerKind::Crown,
            },
            &mut ctx,
        );
        assert_eq!(state.role(), Role::King);
        (state, ctx)
    }

    fn join(
        state: KingdomState,
        ctx: &mut MachineContext,
        member: &str,
    ) -> (KingdomState, Vec<KingdomEffect>, ConnectionId) {
        let conn = conn_id();
        let (state, fx) = state.handle(
            KingdomEvent::Incoming {
                connection: conn,
                remote: id(member),
            },
            ctx,
        );
        (state, fx, conn)
    }

    fn pronounced(fx: &[KingdomEffect]) -> Option<DeviceId> {
        fx.iter().find_map(|e| match e {
            KingdomEffect::BroadcastAdmin(AdminMessage::PronouncePrince { prince }) => {
                Some(prince.clone())
            }
            _ => None,
        })
    }

    fn ack(state: KingdomState, ctx: &mut MachineContext, prince: &str) -> (KingdomState, Vec<KingdomEffect>) {
        state.handle(
            KingdomEvent::Admin {
                from: id(prince),
                message: AdminMessage::AckPronouncePrince {
                    prince: id(prince),
                    metadata: vec![],
                },
            },
            ctx,
        )
    }

    #[test]
    fn first_member_is_adopted_and_pronounced() {
        let (state, mut ctx) = crowned("k");
        let (state, fx, conn) = join(state, &mut ctx, "a");
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::Adopt(c) if *c == conn)));
        assert_eq!(pronounced(&fx), Some(id("a")));
        assert!(has_effect(&fx, |e| matches!(
            e,
            KingdomEffect::BroadcastAdmin(AdminMessage::Census { census }) if census.contains(&id("a"))
        )));
        assert_eq!(state.census().member_count(), 1);
    }

    #[test]
    fn greatest_member_at_pronouncement_time_wins() {
        let (state, mut ctx) = crowned("k");
        let (state, _, _) = join(state, &mut ctx, "b");
        let (state, fx, _) = join(state, &mut ctx, "z");
        // A pronouncement is outstanding; it is not reissued.
        assert_eq!(pronounced(&fx), None);
        let (state, _) = ack(state, &mut ctx, "b");
        assert_eq!(state.census().prince(), Some(&id("b")));
    }

    #[test]
    fn ack_confirms_prince_once() {
        let (state, mut ctx) = crowned("k");
        let (state, _, _) = join(state, &mut ctx, "a");
        let (state, fx) = ack(state, &mut ctx, "a");
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::Emit(ProtocolEvent::PrincePronounced { .. }))));
        let (_state, fx) = ack(state, &mut ctx, "a");
        assert!(fx.is_empty());
    }

    #[test]
    fn ack_from_someone_else_is_ignored() {
        let (state, mut ctx) = crowned("k");
        let (state, _, _) = join(state, &mut ctx, "a");
        let (state, _, _) = join(state, &mut ctx, "b");
        let (state, fx) = ack(state, &mut ctx, "b");
        assert!(fx.is_empty());
        assert_eq!(state.census().prince(), None);
    }

    #[test]
    fn prince_leaving_pronounces_next_heir() {
        let (state, mut ctx) = crowned("k");
        let (state, _, conn_a) = join(state, &mut ctx, "a");
        let (state, _) = ack(state, &mut ctx, "a");
        let (state, _, _) = join(state, &mut ctx, "c");
        let (state, fx) = state.handle(
            KingdomEvent::ConnectionClosed {
                connection: conn_a,
                remote: id("a"),
            },
            &mut ctx,
        );
        assert_eq!(pronounced(&fx), Some(id("c")));
        assert!(!state.census().contains(&id("a")));
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::Emit(ProtocolEvent::MemberLeft { .. }))));
    }

    #[test]
    fn stale_close_of_replaced_member_is_ignored() {
        let (state, mut ctx) = crowned("k");
        let (state, _, old) = join(state, &mut ctx, "a");
        let (state, fx, _new) = join(state, &mut ctx, "a");
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::Disconnect(d) if *d == id("a"))));
        let (state, fx) = state.handle(
            KingdomEvent::ConnectionClosed {
                connection: old,
                remote: id("a"),
            },
            &mut ctx,
        );
        assert!(fx.is_empty());
        assert!(state.census().contains(&id("a")));
    }

    #[test]
    fn lesser_rival_is_ignored() {
        let (state, mut ctx) = crowned("m");
        let (state, fx) = state.handle(king_beacon("a"), &mut ctx);
        assert_eq!(state.role(), Role::King);
        assert!(fx.is_empty());
    }

    #[test]
    fn greater_rival_triggers_bow_down_and_abdication() {
        let (state, mut ctx) = crowned("a");
        let (state, _, _) = join(state, &mut ctx, "p");
        let (state, fx) = state.handle(king_beacon("b"), &mut ctx);
        assert!(has_effect(&fx, |e| matches!(
            e,
            KingdomEffect::BroadcastAdmin(AdminMessage::BowDownToNewKing { new_king, .. }) if *new_king == id("b")
        )));
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::DisconnectAll { flush: true })));
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::SetMaster(false))));
        let (ticket, target) = dial_ticket(&fx).unwrap();
        assert_eq!(target, id("b"));

        // Abdicating: further rivals and incoming connections are turned away.
        let (state, fx) = state.handle(king_beacon("c"), &mut ctx);
        assert!(fx.is_empty());
        let late = conn_id();
        let (state, fx) = state.handle(
            KingdomEvent::Incoming {
                connection: late,
                remote: id("q"),
            },
            &mut ctx,
        );
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::Reject(c) if *c == late)));

        let (state, _) = state.handle(
            KingdomEvent::DialSucceeded {
                ticket,
                connection: conn_id(),
                remote: id("b"),
            },
            &mut ctx,
        );
        match state {
            KingdomState::Peasant(p) => assert_eq!(p.reason(), PeasantReason::BowedDown),
            other => panic!("expected peasant, got {:?}", other.role()),
        }
    }

    #[test]
    fn failed_abdication_goes_free() {
        let (state, mut ctx) = crowned("a");
        let (state, fx) = state.handle(king_beacon("b"), &mut ctx);
        let (ticket, target) = dial_ticket(&fx).unwrap();
        let (state, _) = state.handle(KingdomEvent::DialFailed { ticket, target }, &mut ctx);
        assert_eq!(state.role(), Role::Free);
    }

    #[test]
    fn member_reports_trigger_merge() {
        let (state, mut ctx) = crowned("a");
        let (state, _, _) = join(state, &mut ctx, "p");
        let (state, fx) = state.handle(
            KingdomEvent::Admin {
                from: id("p"),
                message: AdminMessage::DiscoveredDevice {
                    beacon: Beacon::new(id("z"), Role::King, vec![]),
                },
            },
            &mut ctx,
        );
        assert!(dial_ticket(&fx).is_some());
        match state {
            KingdomState::King(k) => assert!(k.is_abdicating()),
            other => panic!("expected king, got {:?}", other.role()),
        }
    }

    #[test]
    fn member_reported_sighting_is_remembered() {
        let (state, mut ctx) = crowned("a");
        let (state, _, _) = join(state, &mut ctx, "p");
        let metadata = vec![ConnectionMetadata::memory(&id("f"))];
        let (state, fx) = state.handle(
            KingdomEvent::Admin {
                from: id("p"),
                message: AdminMessage::DiscoveredDevice {
                    beacon: Beacon::new(id("f"), Role::Free, metadata.clone()),
                },
            },
            &mut ctx,
        );
        assert!(dial_ticket(&fx).is_none());
        assert_eq!(ctx.beacons().get(&id("f")), Some(metadata));
        assert_eq!(state.role(), Role::King);
    }

    #[test]
    fn prince_found_king_from_stranger_is_ignored() {
        let (state, mut ctx) = crowned("a");
        let (_state, fx) = state.handle(
            KingdomEvent::Admin {
                from: id("x"),
                message: AdminMessage::PrinceFoundAKing {
                    king: id("z"),
                    metadata: vec![],
                },
            },
            &mut ctx,
        );
        assert!(fx.is_empty());
    }

    #[test]
    fn idle_king_reverts_to_free() {
        let mut ctx = MachineContext::new(
            id("k"),
            vec![],
            ElectionConfig {
                king_idle_timeout: Some(std::time::Duration::from_secs(1)),
                ..ElectionConfig::default()
            },
            crate::discovery::BeaconStore::new(),
        );
        let (state, fx) = KingdomState::initial(&mut ctx);
        let crown = timer_ticket(&fx, TimerKind::Crown).unwrap();
        let (state, fx) = state.handle(
            KingdomEvent::Timeout {
                ticket: crown,
                timer: TimerKind::Crown,
            },
            &mut ctx,
        );
        let idle = timer_ticket(&fx, TimerKind::Idle).unwrap();
        let (state, fx) = state.handle(
            KingdomEvent::Timeout {
                ticket: idle,
                timer: TimerKind::Idle,
            },
            &mut ctx,
        );
        assert_eq!(state.role(), Role::Free);
        assert!(has_effect(&fx, |e| matches!(e, KingdomEffect::SetMaster(false))));
    }

    #[test]
    fn review_repeats_unacknowledged_pronouncement() {
        let (state, mut ctx) = crowned("k");
        let (state, _, _) = join(state, &mut ctx, "a");
        let review = match &state {
            KingdomState::King(k) => k.review.unwrap(),
            _ => unreachable!(),
        };
        let (_state, fx) = state.handle(
            KingdomEvent::Timeout {
                ticket: review,
                timer: TimerKind::PrinceReview,
            },
            &mut ctx,
        );
        assert!(has_effect(&fx, |e| matches!(
            e,
            KingdomEffect::SendAdmin { to, message: AdminMessage::PronouncePrince { .. } } if *to == id("a")
        )));
        assert!(timer_ticket(&fx, TimerKind::PrinceReview).is_some());
    }
}
