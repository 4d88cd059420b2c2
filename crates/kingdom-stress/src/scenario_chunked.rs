/// Chunked scenario: payloads far above the frame limit cross the
/// kingdom in pieces and arrive whole.
use std::time::{Duration, Instant};

use rand::Rng;

use kingdom_protocol::{ChannelSubscription, Role};

use crate::scenario_common::{
    shutdown_all, timed_step_async, wait_members, wait_role, Field, ScenarioResult, SCAN_INTERVAL,
};

const SETTLE: Duration = Duration::from_secs(5);
const CHANNEL: u16 = 9;

pub async fn run() -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("chunked");
    let start = Instant::now();

    let field = Field::new();
    let k = field.spawn("k")?;
    let a = field.spawn("a")?;
    let id_a = a.handle.local_id().clone();
    let scanner = field.airwaves.spawn_scanner(SCAN_INTERVAL);

    result.add(timed_step_async("k crowned", || wait_role(&k, Role::King, SETTLE)).await);
    result.add(timed_step_async("a joins", || wait_members(&k, vec![id_a.clone()], SETTLE)).await);

    let mut at_a = a.handle.subscribe(CHANNEL)?;
    let mut at_k = k.handle.subscribe(CHANNEL)?;
    let frame = a.handle.channels().frame_limit();

    let step = timed_step_async("subscriptions reach the king", || async {
        let deadline = Instant::now() + SETTLE;
        while Instant::now() < deadline {
            if k.handle.channels().channel(CHANNEL).subscribers().len() == 2 {
                return Ok(String::new());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err("subscriptions missing".into())
    })
    .await;
    result.add(step);

    // Uneven size: the last chunk is partial.
    let big = random_payload(50 * frame + frame / 3);
    let step = timed_step_async("king sends 50+ frames", || async {
        k.handle.publish(CHANNEL, big.clone()).map_err(|e| e.to_string())?;
        arrives(&mut at_a, &big).await?;
        arrives(&mut at_k, &big).await
    })
    .await;
    result.add(step);

    // Exact multiple: an empty terminator closes the sequence.
    let even = random_payload(16 * frame);
    let step = timed_step_async("member sends exact multiple", || async {
        a.handle.publish(CHANNEL, even.clone()).map_err(|e| e.to_string())?;
        arrives(&mut at_k, &even).await?;
        arrives(&mut at_a, &even).await
    })
    .await;
    result.add(step);

    let step = timed_step_async("interleaved senders", || async {
        let from_k = random_payload(8 * frame + 1);
        let from_a = random_payload(8 * frame + 2);
        k.handle.publish(CHANNEL, from_k.clone()).map_err(|e| e.to_string())?;
        a.handle.publish(CHANNEL, from_a.clone()).map_err(|e| e.to_string())?;
        let mut seen = Vec::new();
        for _ in 0..2 {
            match at_a.recv_timeout(Duration::from_secs(5)).await {
                Some(got) => seen.push(got.len()),
                None => return Err(format!("only {} of 2 arrived", seen.len())),
            }
        }
        seen.sort_unstable();
        if seen == [from_k.len(), from_a.len()] {
            Ok(String::new())
        } else {
            Err(format!("sizes {seen:?}"))
        }
    })
    .await;
    result.add(step);

    scanner.abort();
    drop((at_a, at_k));
    shutdown_all(&[&k, &a]).await;
    result.finalize(start);
    Ok(result)
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill(&mut buf[..]);
    buf
}

async fn arrives(sub: &mut ChannelSubscription, expected: &[u8]) -> Result<String, String> {
    match sub.recv_timeout(Duration::from_secs(5)).await {
        Some(got) if got.as_ref() == expected => Ok(format!("{} bytes", got.len())),
        Some(got) => Err(format!("got {} bytes, expected {}", got.len(), expected.len())),
        None => Err("nothing arrived".into()),
    }
}
