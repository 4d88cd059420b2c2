//! Channel routing through a master, over in-memory connections.

use std::time::Duration;

use bytes::Bytes;
use kingdom_protocol::message::codec;
use kingdom_protocol::{
    ChannelConfig, ChannelManager, DeviceId, LinkConfig, ManagerEvent, Message, MessageKind,
    MessageSender, PickPolicy, Priority,
};
use kingdom_transport::Connection;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(3);

fn id(s: &str) -> DeviceId {
    s.parse().unwrap()
}

struct Pair {
    master: ChannelManager,
    client: ChannelManager,
    _events: (
        mpsc::UnboundedReceiver<ManagerEvent>,
        mpsc::UnboundedReceiver<ManagerEvent>,
    ),
}

async fn pair(link: LinkConfig) -> Pair {
    let (master, master_events) = ChannelManager::new(id("k"), link.clone(), ChannelConfig::default());
    let (client, client_events) = ChannelManager::new(id("a"), link, ChannelConfig::default());
    master.set_master(true).await.unwrap();
    let (at_k, at_a) = Connection::pipe(id("k"), id("a"), 64 * 1024);
    master.add_connection(at_k).await.unwrap();
    client.add_connection(at_a).await.unwrap();
    Pair {
        master,
        client,
        _events: (master_events, client_events),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn subscriber_receives_until_it_unsubscribes() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let p = pair(LinkConfig::default()).await;
    let mut sub = p.client.subscribe(7).unwrap();

    assert!(eventually(|| p.master.channel(7).is_subscriber(&id("a"))).await);
    // The client mirror updates only when the announcement loops back.
    assert!(eventually(|| p.client.channel(7).is_subscriber(&id("a"))).await);

    p.master.publish(7, "from king").unwrap();
    assert_eq!(sub.recv_timeout(WAIT).await, Some(Bytes::from("from king")));

    p.client.publish(7, "from member").unwrap();
    assert_eq!(sub.recv_timeout(WAIT).await, Some(Bytes::from("from member")));

    drop(sub);
    assert!(eventually(|| !p.master.channel(7).is_subscriber(&id("a"))).await);
    assert!(eventually(|| !p.client.channel(7).is_subscriber(&id("a"))).await);
}

#[tokio::test]
async fn non_subscribers_get_nothing() {
    let p = pair(LinkConfig::default()).await;
    let mut king_sub = p.master.subscribe(3).unwrap();
    assert!(eventually(|| p.master.channel(3).is_subscriber(&id("k"))).await);

    // The member listens on another channel only.
    let mut other = p.client.subscribe(4).unwrap();
    assert!(eventually(|| p.master.channel(4).is_subscriber(&id("a"))).await);

    p.client.publish(3, "for the king").unwrap();
    assert_eq!(king_sub.recv_timeout(WAIT).await, Some(Bytes::from("for the king")));
    assert_eq!(other.recv_timeout(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn exclude_sender_skips_the_origin() {
    let p = pair(LinkConfig::default()).await;
    let mut member = p.client.subscribe(5).unwrap();
    let mut king = p.master.subscribe(5).unwrap();
    assert!(eventually(|| p.master.channel(5).subscribers().len() == 2).await);

    p.client.channel(5).set_exclude_sender(true);
    p.client.publish(5, "echo?").unwrap();

    assert_eq!(king.recv_timeout(WAIT).await, Some(Bytes::from("echo?")));
    assert_eq!(member.recv_timeout(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn lost_member_is_pruned_from_subscriber_sets() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let (master, _events) = ChannelManager::new(id("k"), LinkConfig::default(), ChannelConfig::default());
    let (client, _client_events) = ChannelManager::new(id("a"), LinkConfig::default(), ChannelConfig::default());
    master.set_master(true).await.unwrap();
    let (at_k, at_a) = Connection::pipe(id("k"), id("a"), 64 * 1024);
    master.add_connection(at_k).await.unwrap();
    client.add_connection(at_a.clone()).await.unwrap();

    let _sub = client.subscribe(9).unwrap();
    assert!(eventually(|| master.channel(9).is_subscriber(&id("a"))).await);

    at_a.disconnect();
    assert!(eventually(|| !master.channel(9).is_subscriber(&id("a"))).await);
    assert!(eventually(|| master.connection_count() == 0).await);
}

#[tokio::test]
async fn late_member_learns_existing_subscribers() {
    let (master, _events) = ChannelManager::new(id("k"), LinkConfig::default(), ChannelConfig::default());
    master.set_master(true).await.unwrap();
    let _king_sub = master.subscribe(2).unwrap();
    assert!(eventually(|| master.channel(2).is_subscriber(&id("k"))).await);

    let (client, _client_events) = ChannelManager::new(id("a"), LinkConfig::default(), ChannelConfig::default());
    let (at_k, at_a) = Connection::pipe(id("k"), id("a"), 64 * 1024);
    master.add_connection(at_k).await.unwrap();
    client.add_connection(at_a).await.unwrap();

    assert!(eventually(|| client.channel(2).is_subscriber(&id("k"))).await);
    assert_eq!(client.channel(2).subscribers(), vec![id("k")]);
}

#[tokio::test]
async fn oversized_payload_is_chunked_and_reassembled() {
    let p = pair(LinkConfig::default().max_frame_payload(32)).await;
    let mut sub = p.client.subscribe(11).unwrap();
    assert!(eventually(|| p.master.channel(11).is_subscriber(&id("a"))).await);

    let big: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    p.master.publish(11, big.clone()).unwrap();
    assert_eq!(sub.recv_timeout(WAIT).await, Some(Bytes::from(big)));

    // Exactly two frames' worth: needs the empty terminator.
    let even = vec![7u8; 64];
    p.master.publish(11, even.clone()).unwrap();
    assert_eq!(sub.recv_timeout(WAIT).await, Some(Bytes::from(even)));
}

// ── Picking policies ────────────────────────────────────────────────

async fn picked(policy: PickPolicy) -> Vec<Bytes> {
    let config = ChannelConfig::default()
        .policy(policy)
        .min_delay(Duration::from_millis(100));
    let (master, _events) = ChannelManager::new(id("k"), LinkConfig::default(), config);
    master.set_master(true).await.unwrap();
    let mut sub = master.subscribe(1).unwrap();
    assert!(eventually(|| master.channel(1).is_subscriber(&id("k"))).await);

    for n in 1..=5 {
        master.publish(1, format!("m{n}")).unwrap();
    }
    let mut got = Vec::new();
    while let Some(payload) = sub.recv_timeout(Duration::from_millis(400)).await {
        got.push(payload);
    }
    got
}

#[tokio::test]
async fn discard_old_keeps_only_the_newest() {
    assert_eq!(picked(PickPolicy::DiscardOld).await, vec![Bytes::from("m5")]);
}

#[tokio::test]
async fn discard_new_keeps_only_the_oldest() {
    assert_eq!(picked(PickPolicy::DiscardNew).await, vec![Bytes::from("m1")]);
}

#[tokio::test]
async fn process_all_keeps_everything_in_order() {
    let expected: Vec<Bytes> = (1..=5).map(|n| Bytes::from(format!("m{n}"))).collect();
    assert_eq!(picked(PickPolicy::ProcessAll).await, expected);
}

// ── Sender priority ─────────────────────────────────────────────────

#[tokio::test]
async fn peer_observes_priority_order() {
    // A tiny pipe keeps the worker stuck on the first frame while the
    // rest queue up behind it.
    let (ours, theirs) = Connection::pipe(id("a"), id("b"), 8);
    let sender = MessageSender::spawn(ours, &LinkConfig::default());
    sender
        .send(Message::channel(1, Priority::Normal, vec![0u8; 64]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    sender.send(Message::channel(1, Priority::Low, "low")).unwrap();
    sender.send(Message::admin("admin-1")).unwrap();
    sender.send(Message::channel(1, Priority::Normal, "normal")).unwrap();
    sender.send(Message::admin("admin-2")).unwrap();

    let filler = codec::read_message(&theirs).await.unwrap();
    assert_eq!(filler.payload.len(), 64);

    let mut seen = Vec::new();
    for _ in 0..4 {
        let m = codec::read_message(&theirs).await.unwrap();
        seen.push((m.kind, m.priority, m.payload));
    }
    assert_eq!(
        seen,
        vec![
            (MessageKind::Admin, Priority::Admin, Bytes::from("admin-1")),
            (MessageKind::Admin, Priority::Admin, Bytes::from("admin-2")),
            (MessageKind::Channel(1), Priority::Normal, Bytes::from("normal")),
            (MessageKind::Channel(1), Priority::Low, Bytes::from("low")),
        ]
    );
    assert!(sender.flush(WAIT).await);
}
