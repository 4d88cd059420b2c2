/// Common types and helpers for protocol-level scenarios.
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kingdom_protocol::{
    DeviceId, ElectionConfig, KingdomRuntime, LinkConfig, MemoryAirwaves, ProtocolEvent, Role,
    RuntimeChannels, RuntimeConfig, RuntimeParts,
};
use kingdom_transport::{ConnectionMetadata, MemoryNetwork};

/// Interval between simulated radio scans.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// Result of a scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a full scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            tracing::warn!(scenario = %self.scenario, step = %step.step, "step failed");
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let icon = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{icon}] Scenario: {} ({:.1}ms)", self.scenario, self.total_ms);
        eprintln!("  {} passed, {} failed", self.passed, self.failed);
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            if let Some(detail) = &step.detail {
                eprint!(": {detail}");
            }
            eprintln!();
        }
    }

    pub fn emit_jsonl(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{json}");
        }
    }
}

/// Run a timed async step.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms,
            detail: if detail.is_empty() { None } else { Some(detail) },
        },
        Err(detail) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms,
            detail: Some(detail),
        },
    }
}

// ── Simulated neighbourhood ─────────────────────────────────────────

/// Devices sharing one in-memory network and one stretch of airwaves.
#[derive(Clone, Default)]
pub struct Field {
    pub network: MemoryNetwork,
    pub airwaves: MemoryAirwaves,
}

impl Field {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a runtime for `name` on the field, in the default zone.
    pub fn spawn(&self, name: &str) -> anyhow::Result<RuntimeChannels> {
        let local: DeviceId = name.parse()?;
        let metadata = vec![ConnectionMetadata::memory(&local)];
        let incoming = self.network.listen(local.clone());
        let (radio, beacons) = self.airwaves.register(local.clone(), metadata.clone());
        Ok(KingdomRuntime::spawn(
            RuntimeParts {
                local_id: local.clone(),
                metadata,
                dialer: Arc::new(self.network.dialer(local)),
                incoming,
                beacons,
                discovery: Arc::new(radio),
            },
            scenario_config(),
        ))
    }

    /// Take `id` off the air and out of reach.
    pub fn vanish(&self, id: &DeviceId) {
        self.airwaves.unregister(id);
        self.network.set_reachable(id, false);
        self.network.sever(id);
    }
}

/// Timings short enough for a run to finish in seconds.
pub fn scenario_config() -> RuntimeConfig {
    RuntimeConfig {
        link: LinkConfig::default()
            .keepalive_interval(Duration::from_millis(100))
            .liveness_timeout(Duration::from_millis(600)),
        election: ElectionConfig {
            free_timeout: Duration::from_millis(300),
            heir_delay: Duration::from_millis(150),
            prince_review_interval: Duration::from_millis(300),
            ..ElectionConfig::default()
        },
        dial_retry_interval: Duration::from_millis(50),
        ..RuntimeConfig::default()
    }
    .with_env_overrides()
}

/// Poll until `node` reports `role`.
pub async fn wait_role(node: &RuntimeChannels, role: Role, timeout: Duration) -> Result<String, String> {
    let deadline = Instant::now() + timeout;
    loop {
        let current = node.handle.role().await;
        if current == role {
            return Ok(format!("{} is {role}", node.handle.local_id()));
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "{} still {current} after {timeout:?}, wanted {role}",
                node.handle.local_id()
            ));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the census of `king` lists every one of `members`.
pub async fn wait_members(
    king: &RuntimeChannels,
    members: Vec<DeviceId>,
    timeout: Duration,
) -> Result<String, String> {
    let deadline = Instant::now() + timeout;
    loop {
        let census = king.handle.census().await;
        if members.iter().all(|m| census.contains(m)) {
            return Ok(format!("{} members", census.member_count()));
        }
        if Instant::now() >= deadline {
            return Err(format!("census incomplete: {census:?}"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Read events until one satisfies `pred`.
pub async fn wait_event(
    node: &mut RuntimeChannels,
    timeout: Duration,
    mut pred: impl FnMut(&ProtocolEvent) -> bool,
) -> Result<ProtocolEvent, String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, node.events.recv()).await {
            Ok(Some(event)) if pred(&event) => return Ok(event),
            Ok(Some(_)) => continue,
            Ok(None) => return Err("event channel closed".into()),
            Err(_) => return Err("timeout".into()),
        }
    }
}

pub async fn shutdown_all(nodes: &[&RuntimeChannels]) {
    for node in nodes {
        node.handle.shutdown().await;
    }
}
