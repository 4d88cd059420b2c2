/// Pub/sub scenario: a three-device kingdom trades messages on a shared
/// channel, then one member unsubscribes.
use std::time::{Duration, Instant};

use kingdom_protocol::{ChannelSubscription, Role, RuntimeChannels};

use crate::scenario_common::{
    shutdown_all, timed_step_async, wait_members, wait_role, Field, ScenarioResult, SCAN_INTERVAL,
};

const SETTLE: Duration = Duration::from_secs(5);
const CHANNEL: u16 = 1;

pub async fn run() -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("pubsub");
    let start = Instant::now();

    let field = Field::new();
    let w = field.spawn("w")?;
    let u = field.spawn("u")?;
    let v = field.spawn("v")?;
    let (id_u, id_v) = (u.handle.local_id().clone(), v.handle.local_id().clone());
    let scanner = field.airwaves.spawn_scanner(SCAN_INTERVAL);

    result.add(timed_step_async("w crowned", || wait_role(&w, Role::King, SETTLE)).await);
    result.add(
        timed_step_async("u and v join", || {
            wait_members(&w, vec![id_u.clone(), id_v.clone()], SETTLE)
        })
        .await,
    );

    let mut subs = Vec::new();
    for node in [&w, &u, &v] {
        subs.push(node.handle.subscribe(CHANNEL)?);
    }
    let step = timed_step_async("subscriptions reach the king", || async {
        let deadline = Instant::now() + SETTLE;
        loop {
            let count = w.handle.channels().channel(CHANNEL).subscribers().len();
            if count == 3 {
                return Ok("3 subscribers".to_string());
            }
            if Instant::now() >= deadline {
                return Err(format!("{count} subscribers"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("member publish fans out", || async {
        u.handle.publish(CHANNEL, "hello from u").map_err(|e| e.to_string())?;
        expect_all(&mut subs, b"hello from u").await
    })
    .await;
    result.add(step);

    let step = timed_step_async("king publish fans out", || async {
        w.handle.publish(CHANNEL, "hello from w").map_err(|e| e.to_string())?;
        expect_all(&mut subs, b"hello from w").await
    })
    .await;
    result.add(step);

    // ── u leaves the channel ────────────────────────────────────────
    drop(subs.remove(1));
    let step = timed_step_async("unsubscribe propagates", || async {
        let deadline = Instant::now() + SETTLE;
        while Instant::now() < deadline {
            if !mirrored(&w, &id_u) && !mirrored(&v, &id_u) {
                return Ok(String::new());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err("u still listed as subscriber".into())
    })
    .await;
    result.add(step);

    let step = timed_step_async("remaining subscribers still served", || async {
        v.handle.publish(CHANNEL, "after u left").map_err(|e| e.to_string())?;
        expect_all(&mut subs, b"after u left").await
    })
    .await;
    result.add(step);

    scanner.abort();
    shutdown_all(&[&w, &u, &v]).await;
    result.finalize(start);
    Ok(result)
}

fn mirrored(node: &RuntimeChannels, device: &kingdom_protocol::DeviceId) -> bool {
    node.handle.channels().channel(CHANNEL).is_subscriber(device)
}

async fn expect_all(subs: &mut [ChannelSubscription], payload: &[u8]) -> Result<String, String> {
    for (i, sub) in subs.iter_mut().enumerate() {
        match sub.recv_timeout(Duration::from_secs(2)).await {
            Some(got) if got.as_ref() == payload => {}
            Some(got) => return Err(format!("subscriber {i} got {} unexpected bytes", got.len())),
            None => return Err(format!("subscriber {i} got nothing")),
        }
    }
    Ok(format!("{} deliveries", subs.len()))
}
