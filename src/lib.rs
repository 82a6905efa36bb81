use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use std::convert::Infallible;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

pub mod audit;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod ephemeral;
pub mod error;
pub mod health;
pub mod ingress;
pub mod metrics;
pub mod model;
pub mod presence;
pub mod queue;
pub mod ratelimit;
pub mod router;
pub mod sync;
pub mod utils;

pub use context::{Collaborators, Engine};

use config::Config;

type HttpResult = Result<Response<Full<Bytes>>, Infallible>;

async fn http_handler(req: Request<IncomingBody>, engine: Engine) -> HttpResult {
    let response = match req.uri().path() {
        "/health" => match health::health_check(&engine).await {
            Ok(_) => Response::new(Full::new(Bytes::from("OK"))),
            Err(e) => {
                tracing::error!("Health check failed: {}", e);
                let mut res = Response::new(Full::new(Bytes::from("Service Unavailable")));
                *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                res
            }
        },
        "/metrics" => match metrics::gather_metrics() {
            Ok(metrics_data) => {
                let mut res = Response::new(Full::new(Bytes::from(metrics_data)));
                res.headers_mut()
                    .insert("Content-Type", "text/plain; version=0.0.4".parse().unwrap());
                res
            }
            Err(e) => {
                tracing::error!("Failed to gather metrics: {}", e);
                let mut res = Response::new(Full::new(Bytes::from("Internal Server Error")));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        },
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::from("Not Found")));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

pub async fn run_http_server(engine: Engine) -> Result<()> {
    let http_addr = format!("0.0.0.0:{}", engine.config.health_port);
    let listener = TcpListener::bind(&http_addr).await?;
    tracing::info!("HTTP server listening on http://{}", http_addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let engine = engine.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| http_handler(req, engine.clone()));

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Error serving HTTP connection: {:?}", err);
            }
        });
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration and wire the engine with in-process collaborators;
    // production deployments replace the seams in Collaborators.
    let config = Config::from_env()?;
    let collaborators = Collaborators::in_process(&config);
    let engine = Engine::new(config, collaborators);

    tracing::info!(
        partitions = engine.queue.partition_count(),
        "Courier engine starting"
    );

    let background = engine.spawn_background();
    let http_server = run_http_server(engine.clone());

    tokio::select! {
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server failed: {}", e);
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Shutdown signal received. Shutting down...");
        }
    }

    engine.shutdown();
    for handle in background {
        let _ = handle.await;
    }

    Ok(())
}
