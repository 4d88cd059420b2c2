//! `all`: every scenario in turn, folded into one suite result where each
//! scenario counts as a single step.
use std::time::Instant;

use crate::scenario_common::{ScenarioResult, StepResult};
use crate::{scenario_chunked, scenario_failover, scenario_merge, scenario_pubsub};

pub async fn run(json: bool) -> ScenarioResult {
    let start = Instant::now();
    let mut suite = ScenarioResult::new("all");

    suite.add(fold("merge", scenario_merge::run().await, json));
    suite.add(fold("failover", scenario_failover::run().await, json));
    suite.add(fold("pubsub", scenario_pubsub::run().await, json));
    suite.add(fold("chunked", scenario_chunked::run().await, json));

    suite.finalize(start);
    suite
}

/// Report a finished scenario and condense it to one suite step.
fn fold(name: &str, outcome: anyhow::Result<ScenarioResult>, json: bool) -> StepResult {
    match outcome {
        Ok(result) => {
            result.print_summary();
            if json {
                result.emit_jsonl();
            }
            StepResult {
                step: name.into(),
                ok: result.success(),
                elapsed_ms: result.total_ms,
                detail: Some(format!(
                    "{}/{} steps",
                    result.passed,
                    result.passed + result.failed
                )),
            }
        }
        // Setup errors never produced a result of their own.
        Err(e) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms: 0.0,
            detail: Some(format!("could not run: {e:#}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_with_a_failed_step_fails_the_suite_step() {
        let mut result = ScenarioResult::new("pubsub");
        for ok in [true, false, true] {
            result.add(StepResult {
                step: "send".into(),
                ok,
                elapsed_ms: 1.0,
                detail: None,
            });
        }
        let step = fold("pubsub", Ok(result), false);
        assert!(!step.ok);
        assert_eq!(step.detail.as_deref(), Some("2/3 steps"));
    }

    #[test]
    fn setup_error_becomes_a_failed_step() {
        let step = fold("merge", Err(anyhow::anyhow!("no airwaves")), false);
        assert!(!step.ok);
        assert_eq!(step.step, "merge");
        assert!(step.detail.unwrap().contains("no airwaves"));
    }
}
