//! batchwise - drive the batch engine from the command line.
//!
//! ```bash
//! # 12 billing requests against the simulated collaborator
//! batchwise simulate --type billing_codes --count 12
//!
//! # Every batch comes back unparseable
//! batchwise simulate --type sdoh_detection --count 5 --malformed
//!
//! # Effective configuration from BATCHWISE_* variables
//! BATCHWISE_MAX_WAIT_MS=2000 batchwise config
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use batchwise_engine::{
    BatchConfig, BatchEngine, EngineConfig, EnqueueOptions, HttpInferenceClient, InferenceClient,
    InferenceResult, Priority, RequestType, SimulatedClient, SimulatedReply, TracingSink,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "batchwise")]
#[command(version)]
#[command(about = "Batchwise - batch expensive inference calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue synthetic requests and report how they were batched
    Simulate {
        /// Request type to enqueue
        #[arg(short = 't', long = "type", default_value = "billing_codes")]
        request_type: String,

        /// Number of requests
        #[arg(short, long, default_value_t = 12)]
        count: usize,

        /// Priority for every request (critical, high, normal, low, batch)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Delay between enqueues in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Override max batch size for the type
        #[arg(long)]
        max_batch: Option<usize>,

        /// Override min batch size for the type
        #[arg(long)]
        min_batch: Option<usize>,

        /// Override the batch window for the type
        #[arg(long)]
        max_wait_ms: Option<u64>,

        /// Simulated call latency in milliseconds
        #[arg(long, default_value_t = 250)]
        latency_ms: u64,

        /// Simulated cost per batched item
        #[arg(long, default_value_t = 0.01)]
        cost_per_item: f64,

        /// Reply with text that is not JSON
        #[arg(long, conflicts_with_all = ["fail", "truncate"])]
        malformed: bool,

        /// Fail every call
        #[arg(long, conflicts_with = "truncate")]
        fail: bool,

        /// Return only the first N entries of each batch
        #[arg(long)]
        truncate: Option<usize>,

        /// Call a real inference endpoint instead of the simulator
        #[arg(long)]
        endpoint: Option<String>,

        /// Also print Prometheus metrics
        #[arg(long)]
        prometheus: bool,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Start from a preset instead of the environment
        #[arg(long, value_enum)]
        preset: Option<Preset>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    LowLatency,
    CostOptimized,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("batchwise_engine=info,batchwise=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            request_type,
            count,
            priority,
            interval_ms,
            max_batch,
            min_batch,
            max_wait_ms,
            latency_ms,
            cost_per_item,
            malformed,
            fail,
            truncate,
            endpoint,
            prometheus,
        } => {
            let request_type = RequestType::new(request_type);
            let mut config = EngineConfig::from_env();
            let mut batch = config.batch_config_for(&request_type);
            if let Some(n) = max_batch {
                batch.max_batch_size = n;
            }
            if let Some(n) = min_batch {
                batch.min_batch_size = n;
            }
            if let Some(ms) = max_wait_ms {
                batch.max_wait = Duration::from_millis(ms);
            }
            config = config.with_type_config(request_type.clone(), batch);

            let client: Arc<dyn InferenceClient> = match endpoint {
                Some(url) => {
                    let mut http = HttpInferenceClient::new(url, Duration::from_secs(120))?;
                    if let Ok(key) = std::env::var("BATCHWISE_API_KEY") {
                        http = http.with_api_key(key);
                    }
                    Arc::new(http)
                }
                None => {
                    let reply = if malformed {
                        SimulatedReply::Malformed
                    } else if fail {
                        SimulatedReply::Fail("simulated outage".to_string())
                    } else if let Some(n) = truncate {
                        SimulatedReply::Truncated(n)
                    } else {
                        SimulatedReply::Echo
                    };
                    Arc::new(
                        SimulatedClient::new()
                            .with_latency(Duration::from_millis(latency_ms))
                            .with_cost_per_item(cost_per_item)
                            .with_default_reply(reply),
                    )
                }
            };

            simulate(config, client, request_type, batch, count, priority, interval_ms).await?;

            if prometheus {
                println!("\n=== Prometheus ===");
                print!("{}", batchwise_engine::metrics::encode_metrics());
            }
        }

        Commands::Config { preset } => {
            let config = match preset {
                Some(Preset::LowLatency) => EngineConfig::low_latency(),
                Some(Preset::CostOptimized) => EngineConfig::cost_optimized(),
                None => EngineConfig::from_env(),
            };
            if let Err(e) = config.validate() {
                warn!("Configuration is invalid: {}", e);
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn simulate(
    config: EngineConfig,
    client: Arc<dyn InferenceClient>,
    request_type: RequestType,
    batch: BatchConfig,
    count: usize,
    priority: Priority,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let engine = BatchEngine::builder(config, client).sink(Arc::new(TracingSink)).build()?;

    info!(
        request_type = %request_type,
        count,
        max_batch = batch.max_batch_size,
        min_batch = batch.min_batch_size,
        max_wait_ms = batch.max_wait.as_millis() as u64,
        "Starting simulation"
    );

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let payload = json!({ "item": i, "note": format!("synthetic record {}", i) });
        let ack = engine.enqueue(request_type.clone(), payload, EnqueueOptions::with_priority(priority))?;
        ids.push(ack.request_id);
        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    println!("=== Queue Stats (after enqueue) ===");
    println!("{}", serde_json::to_string_pretty(&engine.get_queue_stats())?);

    let timeout = batch.max_wait * 2 + Duration::from_secs(130);
    let mut results: Vec<InferenceResult> = Vec::with_capacity(count);
    for id in &ids {
        match engine.await_result(*id, timeout).await {
            Ok(result) => results.push(result),
            Err(e) => warn!(request_id = %id, "No result: {}", e),
        }
    }
    engine.shutdown().await;

    let mut batches: BTreeMap<String, Vec<&InferenceResult>> = BTreeMap::new();
    for result in &results {
        let key = result.batch_id.map_or_else(|| "unbatched".to_string(), |b| b.to_string());
        batches.entry(key).or_default().push(result);
    }

    println!("\n=== Batches ===");
    for (batch_id, members) in &batches {
        let ok = members.iter().filter(|r| r.is_success()).count();
        let cost: f64 = members.iter().map(|r| r.cost).sum();
        let failures: Vec<String> = members
            .iter()
            .filter_map(|r| r.failure_kind())
            .map(|k| k.to_string())
            .collect();
        println!(
            "{}  size={}  ok={}  failed={}  cost={:.4}{}",
            batch_id,
            members.len(),
            ok,
            members.len() - ok,
            cost,
            failures.first().map(|k| format!("  ({})", k)).unwrap_or_default()
        );
    }

    println!("\n=== Metrics ===");
    println!("{}", serde_json::to_string_pretty(&engine.metrics())?);

    Ok(())
}
