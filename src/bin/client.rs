use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use fedcifar::client::ClientUnit;
use fedcifar::protocol::{
    EvaluateRequest, EvaluateResponse, FitRequest, FitResponse, ParametersResponse,
    RegisterRequest, RegisterResponse,
};

#[derive(Parser, Debug)]
#[command(version, about = "Federated CIFAR-10 client")]
struct Args {
    /// Coordinator base URL.
    #[arg(long = "server_address", default_value = "http://0.0.0.0:8080")]
    server_address: String,
    /// Client id; must be below --num_clients.
    #[arg(long)]
    cid: usize,
    /// Number of partitions the shared training set is cut into.
    #[arg(long = "num_clients", default_value_t = 50)]
    num_clients: usize,
    /// Address this client's own HTTP endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8081")]
    bind: String,
    /// URL the coordinator should call back on; derived from --bind when not
    /// given (an unspecified bind address advertises loopback).
    #[arg(long)]
    advertise: Option<String>,
    /// Directory holding the CIFAR-10 binary batches; fetched from the hub
    /// when absent.
    #[arg(long = "data_dir", default_value = "./data")]
    data_dir: PathBuf,
}

type SharedUnit = Arc<Mutex<ClientUnit>>;

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    // Fails on a bad cid before any network activity.
    let unit = ClientUnit::new(&args.data_dir, args.cid, args.num_clients)?;
    let state: SharedUnit = Arc::new(Mutex::new(unit));

    let app = Router::new()
        .route("/parameters", get(parameters))
        .route("/fit", post(fit))
        .route("/evaluate", post(evaluate))
        .with_state(state);

    let addr: SocketAddr = args.bind.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    let http = reqwest::Client::new();
    let register = RegisterRequest {
        client_url: advertised_url(local, args.advertise.as_deref()),
        cid: args.cid,
    };
    let response: RegisterResponse = http
        .post(format!("{}/register", args.server_address))
        .json(&register)
        .send()
        .await?
        .json()
        .await?;
    info!(cid = args.cid, %local, ok = response.ok, "registered with coordinator");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn parameters(
    State(unit): State<SharedUnit>,
) -> Result<Json<ParametersResponse>, StatusCode> {
    let unit = unit.lock().await;
    let params = unit.get_parameters().map_err(internal)?;
    Ok(Json(ParametersResponse { params }))
}

async fn fit(
    State(unit): State<SharedUnit>,
    Json(req): Json<FitRequest>,
) -> Result<Json<FitResponse>, StatusCode> {
    let unit = unit.lock().await;
    let response = unit.fit(&req.params, req.config).map_err(internal)?;
    Ok(Json(response))
}

async fn evaluate(
    State(unit): State<SharedUnit>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, StatusCode> {
    let unit = unit.lock().await;
    let response = unit.evaluate(&req.params).map_err(internal)?;
    Ok(Json(response))
}

fn internal(err: anyhow::Error) -> StatusCode {
    error!(%err, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// The callback URL registered with the coordinator. An explicit --advertise
/// wins; otherwise the bound address is used, substituting loopback when the
/// listener bound an unspecified address.
fn advertised_url(local: SocketAddr, advertise: Option<&str>) -> String {
    if let Some(url) = advertise {
        return url.to_string();
    }
    let host = match local.ip() {
        ip if ip.is_unspecified() => "127.0.0.1".to_string(),
        std::net::IpAddr::V6(ip) => format!("[{ip}]"),
        ip => ip.to_string(),
    };
    format!("http://{}:{}", host, local.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_url_follows_bind_address() {
        let local: SocketAddr = "192.168.1.7:8081".parse().unwrap();
        assert_eq!(advertised_url(local, None), "http://192.168.1.7:8081");

        let v6: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        assert_eq!(advertised_url(v6, None), "http://[2001:db8::1]:9000");
    }

    #[test]
    fn unspecified_bind_advertises_loopback() {
        let local: SocketAddr = "0.0.0.0:8081".parse().unwrap();
        assert_eq!(advertised_url(local, None), "http://127.0.0.1:8081");
    }

    #[test]
    fn explicit_advertise_wins() {
        let local: SocketAddr = "0.0.0.0:8081".parse().unwrap();
        assert_eq!(
            advertised_url(local, Some("http://edge-3.local:8081")),
            "http://edge-3.local:8081"
        );
    }
}
