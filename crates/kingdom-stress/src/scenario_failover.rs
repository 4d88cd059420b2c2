/// Failover scenario: the king vanishes, the prince takes the crown and
/// the remaining peasant follows it.
///
/// Self-contained (spawns 3 in-process runtimes): "p", "q" and "a".
use std::time::{Duration, Instant};

use kingdom_protocol::{PeasantReason, ProtocolEvent, Role, RuntimeChannels};

use crate::scenario_common::{
    shutdown_all, timed_step_async, wait_event, wait_members, wait_role, Field, ScenarioResult,
    SCAN_INTERVAL,
};

const SETTLE: Duration = Duration::from_secs(5);

pub async fn run() -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("failover");
    let start = Instant::now();

    let field = Field::new();
    // The greatest id crowns first; the next one down becomes prince.
    let q = field.spawn("q")?;
    let p = field.spawn("p")?;
    let mut a = field.spawn("a")?;
    let (id_q, id_p, id_a) = (
        q.handle.local_id().clone(),
        p.handle.local_id().clone(),
        a.handle.local_id().clone(),
    );
    let scanner = field.airwaves.spawn_scanner(SCAN_INTERVAL);

    // ── Kingdom forms ───────────────────────────────────────────────
    result.add(timed_step_async("q crowned", || wait_role(&q, Role::King, SETTLE)).await);
    result.add(timed_step_async("p and a join", || wait_members(&q, vec![id_p.clone(), id_a.clone()], SETTLE)).await);
    result.add(timed_step_async("p pronounced", || wait_role(&p, Role::Prince, SETTLE)).await);

    let step = timed_step_async("a learns the prince", || async {
        wait_event(&mut a, SETTLE, |e| {
            matches!(e, ProtocolEvent::CensusUpdated { census } if census.prince() == Some(&id_p))
        })
        .await
        .map(|_| String::new())
    })
    .await;
    result.add(step);

    // ── King vanishes ───────────────────────────────────────────────
    let king_gone = Instant::now();
    field.vanish(&id_q);
    q.handle.shutdown().await;
    tracing::info!(king = %id_q, "king removed");

    result.add(timed_step_async("p crowns itself", || wait_role(&p, Role::King, SETTLE)).await);

    let step = timed_step_async("a follows the heir", || async {
        wait_event(&mut a, SETTLE, |e| {
            matches!(
                e,
                ProtocolEvent::RoleChanged {
                    role: Role::Peasant,
                    reason: Some(PeasantReason::FollowedHeir),
                }
            )
        })
        .await
        .map(|_| format!("{:.0}ms after the king left", king_gone.elapsed().as_secs_f64() * 1000.0))
    })
    .await;
    result.add(step);

    result.add(timed_step_async("p reigns over a", || wait_members(&p, vec![id_a.clone()], SETTLE)).await);
    result.add(timed_step_async("q forgotten", || forgotten(&p, &id_q)).await);

    scanner.abort();
    shutdown_all(&[&p, &a]).await;
    result.finalize(start);
    Ok(result)
}

async fn forgotten(king: &RuntimeChannels, gone: &kingdom_protocol::DeviceId) -> Result<String, String> {
    if king.handle.census().await.contains(gone) {
        Err(format!("{gone} still in census"))
    } else {
        Ok(String::new())
    }
}
