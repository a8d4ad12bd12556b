//! courier-probe: end-to-end smoke check against a configured transport
//!
//! Declares a task queue in one domain, answers tasks and RPC calls on it
//! in-process, then publishes one task and makes one RPC call through the
//! real transport.
//!
//! ## Configuration
//! - `--config <path>` or COURIER_CONFIG: YAML config (see `CourierConfig`)
//! - COURIER_PROBE_DOMAIN: domain to probe (default "probe")
//! - COURIER_LOG: log filter (default "info")

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use courier::config::CourierConfig;
use courier::rpc::{RpcHandler, RpcParams};
use courier::subscriber::Subscriber;
use courier::task::Task;
use courier::transport::{HandlerError, TransportFactory};
use courier::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};
use courier::Pipeline;

const PROBE_QUEUE: &str = "courier-probe";

struct Echo;

#[async_trait]
impl Subscriber for Echo {
    fn queue(&self) -> &str {
        PROBE_QUEUE
    }

    fn identity(&self) -> &str {
        "courier-probe"
    }

    async fn handle_task(&self, task: &mut Task) -> Result<(), HandlerError> {
        let reply = format!("echo: {}", task.content());
        task.add_output(reply);
        task.complete();
        Ok(())
    }
}

#[async_trait]
impl RpcHandler for Echo {
    async fn call(&self, _function: &str, params: RpcParams) -> Result<RpcParams, HandlerError> {
        Ok(params)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = CourierConfig::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let domain = std::env::var("COURIER_PROBE_DOMAIN").unwrap_or_else(|_| "probe".to_string());

    let pipeline = Pipeline::from_config(&config, TransportFactory::new());
    connect_with_retry(&domain, || pipeline.registry().ensure_domain(&domain)).await?;

    pipeline.create_task_queue(&domain, PROBE_QUEUE).await?;
    let echo = Arc::new(Echo);
    pipeline.subscribe_to_queue(&domain, echo.clone()).await?;
    pipeline.serve_rpc(&domain, PROBE_QUEUE, echo).await?;

    let status = pipeline
        .publish_task(&domain, PROBE_QUEUE, "ping", Some(Duration::from_secs(10)), 0)
        .await?;
    info!(
        task_id = %status.task_id,
        state = ?status.current_state,
        output = ?status.output,
        "Task round trip"
    );

    let mut params = RpcParams::new();
    params.insert("probe".to_string(), serde_json::Value::Bool(true));
    let reply = pipeline
        .rpc_call(&domain, PROBE_QUEUE, "echo", params, Some(Duration::from_secs(10)))
        .await?;
    info!(reply = ?reply, "RPC round trip");

    pipeline.remove_task_queue(&domain, PROBE_QUEUE).await?;
    pipeline.shutdown().await;
    Ok(())
}
