// Scripted worker demo
//
// Runs a worker against an in-memory connection that hands out a few tasks,
// then shuts down on Ctrl+C or after the script is drained.
//
// Run with: cargo run -p activity-poller --example scripted_worker
// Isolated: ACTIVITY_ISOLATION_MODE=isolated_process cargo run -p activity-poller --example scripted_worker

use std::sync::Arc;
use std::time::Duration;

use activity_poller::metrics::LogMetrics;
use activity_poller::prelude::*;
use activity_poller::telemetry::{init_telemetry, TelemetryConfig};
use activity_poller::testing::{RecordingProcessor, ScriptedConnection};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

struct Sum;

#[async_trait]
impl Activity for Sum {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<serde_json::Value, ActivityError> {
        let heartbeat = ctx
            .heartbeat_every(Duration::from_millis(100), || async {
                tracing::debug!("still summing");
            })
            .map_err(|e| ActivityError::new(e.to_string()))?;

        let numbers: Vec<i64> = serde_json::from_value(ctx.task.input.clone())
            .map_err(|e| ActivityError::new(e.to_string()).with_type("InvalidInput"))?;
        tokio::time::sleep(Duration::from_millis(250)).await;

        heartbeat.cancel();
        Ok(json!(numbers.iter().sum::<i64>()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryConfig::from_env());

    let queue = QueueId::new("default", "math");
    let connection = Arc::new(ScriptedConnection::new(vec![
        Ok(ActivityTask::new("sum", json!([1, 2, 3]))),
        Ok(ActivityTask::empty()),
        Ok(ActivityTask::new("sum", json!([40, 2]))),
        Err(ConnectionError::Unavailable("simulated outage".into())),
        Ok(ActivityTask::new("sum", json!("not numbers"))),
    ]));
    let processor = Arc::new(RecordingProcessor::executing());

    let deps = PollerDeps::new(connection.clone(), processor.clone())
        .with_metrics(Arc::new(LogMetrics));
    let config = PollerConfig::from_env()?.with_poll_retry_delay(Duration::from_millis(200));

    let mut worker = Worker::new(deps, config);
    worker.register_activity(queue, "sum", Arc::new(Sum));
    let worker = Arc::new(worker);

    let drained = {
        let connection = Arc::clone(&connection);
        async move {
            while connection.remaining() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            // let the last dispatched task run
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    worker
        .run_until(async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                _ = drained => info!("Script drained"),
            }
        })
        .await?;

    for outcome in processor.outcomes() {
        info!(?outcome, "Activity outcome");
    }
    Ok(())
}
