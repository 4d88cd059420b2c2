/// Merge scenario: two kingdoms grow apart, then drift into range.
///
/// Zone 1 holds "m" and "c", zone 2 holds "z". Once both kingdoms have
/// settled, "m" and "c" move into zone 2. The greater king "z" must absorb
/// both without ever merging itself.
use std::time::{Duration, Instant};

use kingdom_protocol::{PeasantReason, ProtocolEvent, Role};

use crate::scenario_common::{
    shutdown_all, timed_step_async, wait_event, wait_members, wait_role, Field, ScenarioResult,
    SCAN_INTERVAL,
};

const SETTLE: Duration = Duration::from_secs(5);

pub async fn run() -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("merge");
    let start = Instant::now();

    let field = Field::new();
    let mut m = field.spawn("m")?;
    let c = field.spawn("c")?;
    let mut z = field.spawn("z")?;
    let (id_m, id_c, id_z) = (
        m.handle.local_id().clone(),
        c.handle.local_id().clone(),
        z.handle.local_id().clone(),
    );
    field.airwaves.move_to_zone(&id_m, 1);
    field.airwaves.move_to_zone(&id_c, 1);
    field.airwaves.move_to_zone(&id_z, 2);
    let scanner = field.airwaves.spawn_scanner(SCAN_INTERVAL);

    // ── Two separate kingdoms ───────────────────────────────────────
    result.add(timed_step_async("m crowned in zone 1", || wait_role(&m, Role::King, SETTLE)).await);
    result.add(timed_step_async("c joins m", || wait_members(&m, vec![id_c.clone()], SETTLE)).await);
    result.add(timed_step_async("z crowned in zone 2", || wait_role(&z, Role::King, SETTLE)).await);

    // ── Drift into range ────────────────────────────────────────────
    field.airwaves.move_to_zone(&id_m, 2);
    field.airwaves.move_to_zone(&id_c, 2);
    tracing::info!("zone 1 moved into zone 2");

    let step = timed_step_async("m bows down to z", || async {
        wait_event(&mut m, SETTLE, |e| {
            matches!(e, ProtocolEvent::KingdomMerging { winner } if *winner == id_z)
        })
        .await?;
        wait_event(&mut m, SETTLE, |e| {
            matches!(
                e,
                ProtocolEvent::RoleChanged {
                    role: Role::Peasant,
                    reason: Some(PeasantReason::BowedDown),
                }
            )
        })
        .await
        .map(|_| "peasant (bowed down)".to_string())
    })
    .await;
    result.add(step);

    result.add(
        timed_step_async("z absorbs m and c", || wait_members(&z, vec![id_m.clone(), id_c.clone()], SETTLE)).await,
    );

    let step = timed_step_async("z never merged", || async {
        if z.handle.role().await != Role::King {
            return Err("z lost its crown".into());
        }
        let mut merges = 0;
        while let Ok(event) = z.events.try_recv() {
            if matches!(event, ProtocolEvent::KingdomMerging { .. }) {
                merges += 1;
            }
        }
        if merges == 0 {
            Ok(String::new())
        } else {
            Err(format!("z reported {merges} merge(s)"))
        }
    })
    .await;
    result.add(step);

    scanner.abort();
    shutdown_all(&[&m, &c, &z]).await;
    result.finalize(start);
    Ok(result)
}
