use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use futures::future::join_all;
use rand::seq::SliceRandom;
use reqwest::Client as Http;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use fedcifar::params::ModelParams;
use fedcifar::protocol::{
    EvaluateRequest, EvaluateResponse, FitConfig, FitRequest, FitResponse, ParametersResponse,
    RegisterRequest, RegisterResponse,
};
use fedcifar::strategy::{self, FedAvg};

#[derive(Parser, Debug)]
#[command(version, about = "Federated CIFAR-10 coordinator")]
struct Args {
    /// Address the coordinator binds to.
    #[arg(long = "server_address", default_value = "0.0.0.0:8080")]
    server_address: String,
    /// Number of federated rounds.
    #[arg(long, default_value_t = 5)]
    rounds: usize,
    /// Fraction of available clients sampled for fit/evaluate.
    #[arg(long = "sample_fraction", default_value_t = 1.0)]
    sample_fraction: f64,
    /// Minimum clients required for sampling; under --settings 0 this value
    /// is wired into every threshold.
    #[arg(long = "min_num_clients", default_value_t = 2)]
    min_num_clients: usize,
    /// Minimum clients per fit round (--settings 1 only).
    #[arg(long = "min_num_fit", default_value_t = 2)]
    min_num_fit: usize,
    /// Minimum clients per evaluate round (--settings 1 only).
    #[arg(long = "min_num_evaluate", default_value_t = 2)]
    min_num_evaluate: usize,
    /// Registrations to wait for before the first round starts.
    #[arg(long = "num_clients", default_value_t = 2)]
    num_clients: usize,
    /// Threshold wiring: 0 repeats --min_num_clients everywhere, 1 applies
    /// the per-phase flags.
    #[arg(long, default_value_t = 0)]
    settings: u8,
    /// Local epochs clients run per fit call.
    #[arg(long, default_value_t = 3)]
    epochs: usize,
    /// Batch size clients use during fit.
    #[arg(long, default_value_t = 16)]
    batch: usize,
}

/// How long to wait for the startup client gate.
const WAIT_FOR_CLIENTS: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Registry {
    clients: RwLock<Vec<String>>,
}

type Shared = Arc<Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let (min_fit, min_evaluate, min_available) = match args.settings {
        0 => (
            args.min_num_clients,
            args.min_num_clients,
            args.min_num_clients,
        ),
        1 => (args.min_num_fit, args.min_num_evaluate, args.min_num_clients),
        other => bail!("--settings must be 0 or 1, got {other}"),
    };

    let (epochs, batch) = (args.epochs, args.batch);
    let strategy = FedAvg {
        num_rounds: args.rounds,
        fraction_fit: args.sample_fraction,
        fraction_evaluate: args.sample_fraction,
        min_fit_clients: min_fit,
        min_evaluate_clients: min_evaluate,
        min_available_clients: min_available,
        on_fit_config: Box::new(move |_round| FitConfig {
            epochs,
            batch_size: batch,
        }),
        evaluate_metrics_aggregation: strategy::weighted_average,
    };

    let registry: Shared = Arc::new(Registry::default());
    let app = Router::new()
        .route("/register", post(register))
        .with_state(registry.clone());

    let addr: SocketAddr = args.server_address.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "coordinator listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "http server exited");
        }
    });

    wait_for_clients(&registry, args.num_clients.max(strategy.min_available_clients)).await?;
    run_rounds(&registry, &strategy).await
}

async fn register(
    State(registry): State<Shared>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let mut clients = registry.clients.write().await;
    if !clients.contains(&req.client_url) {
        info!(cid = req.cid, url = %req.client_url, "client registered");
        clients.push(req.client_url);
    }
    Json(RegisterResponse {
        ok: true,
        message: format!("{} clients registered", clients.len()),
    })
}

async fn wait_for_clients(registry: &Registry, needed: usize) -> Result<()> {
    let deadline = Instant::now() + WAIT_FOR_CLIENTS;
    loop {
        let connected = registry.clients.read().await.len();
        if connected >= needed {
            info!(connected, needed, "client gate satisfied");
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for clients: {connected}/{needed} registered");
        }
        sleep(Duration::from_millis(200)).await;
    }
}

async fn run_rounds(registry: &Registry, strategy: &FedAvg) -> Result<()> {
    let http = Http::new();
    let mut global = initial_parameters(registry, &http).await?;

    for round in 1..=strategy.num_rounds {
        let available = registry.clients.read().await.clone();

        // Fit phase
        let sampled = sample(&available, strategy.num_fit_clients(available.len()));
        info!(round, sampled = sampled.len(), "fit phase");
        let request = FitRequest {
            params: global.clone(),
            config: (strategy.on_fit_config)(round),
        };
        let results = fit_round(&http, &sampled, &request).await;
        global = strategy::aggregate_fit(&results)
            .with_context(|| format!("aggregating fit results for round {round}"))?;

        // Evaluate phase
        let sampled = sample(&available, strategy.num_evaluate_clients(available.len()));
        info!(round, sampled = sampled.len(), "evaluate phase");
        let request = EvaluateRequest {
            params: global.clone(),
        };
        let (losses, metrics) = evaluate_round(&http, &sampled, &request).await;
        let aggregated = (strategy.evaluate_metrics_aggregation)(&metrics);
        info!(
            round,
            loss = losses,
            accuracy = aggregated.get("accuracy").copied().unwrap_or(0.0),
            "round complete"
        );
    }
    Ok(())
}

/// Ask the first registered client for its freshly initialized parameters.
async fn initial_parameters(registry: &Registry, http: &Http) -> Result<ModelParams> {
    let clients = registry.clients.read().await;
    let first = clients.first().context("no clients registered")?;
    let response: ParametersResponse = http
        .get(format!("{first}/parameters"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    info!(num_tensors = response.params.len(), "initial parameters received");
    Ok(response.params)
}

fn sample(available: &[String], count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    available
        .choose_multiple(&mut rng, count)
        .cloned()
        .collect()
}

async fn fit_round(http: &Http, urls: &[String], request: &FitRequest) -> Vec<(usize, ModelParams)> {
    let futures = urls.iter().map(|url| {
        let http = http.clone();
        let request = request.clone();
        let url = url.clone();
        async move {
            let response = http.post(format!("{url}/fit")).json(&request).send().await?;
            response.error_for_status_ref()?;
            response.json::<FitResponse>().await
        }
    });

    let mut results = Vec::new();
    for outcome in join_all(futures).await {
        match outcome {
            Ok(res) => results.push((res.num_examples, res.params)),
            Err(err) => warn!(%err, "client dropped from fit round"),
        }
    }
    results
}

/// Returns the example-weighted mean loss and the raw per-client metrics.
async fn evaluate_round(
    http: &Http,
    urls: &[String],
    request: &EvaluateRequest,
) -> (f64, Vec<(usize, std::collections::HashMap<String, f64>)>) {
    let futures = urls.iter().map(|url| {
        let http = http.clone();
        let request = request.clone();
        let url = url.clone();
        async move {
            let response = http
                .post(format!("{url}/evaluate"))
                .json(&request)
                .send()
                .await?;
            response.error_for_status_ref()?;
            response.json::<EvaluateResponse>().await
        }
    });

    let mut metrics = Vec::new();
    let mut loss_sum = 0f64;
    let mut examples = 0usize;
    for outcome in join_all(futures).await {
        match outcome {
            Ok(res) => {
                loss_sum += res.loss * res.num_examples as f64;
                examples += res.num_examples;
                metrics.push((res.num_examples, res.metrics));
            }
            Err(err) => warn!(%err, "client dropped from evaluate round"),
        }
    }
    let loss = if examples == 0 {
        0.0
    } else {
        loss_sum / examples as f64
    };
    (loss, metrics)
}
