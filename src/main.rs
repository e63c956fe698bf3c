//! Gazelink - Real-time gaze telemetry
//!
//! Main entry point for the CLI application.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gazelink::{
    config::Config,
    pipeline::{GazePipeline, PipelineRunner},
    session::SessionClient,
    tracking::{mediapipe::MpLandmarkReceiver, subprocess::TrackerSubprocess},
    transport::{TelemetryTransport, WsConnector},
    web::WebServer,
    AppState,
};

/// Gazelink - stream normalized gaze telemetry to an analysis backend
#[derive(Parser, Debug)]
#[command(name = "gazelink", version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Telemetry websocket URL (overrides config)
    #[arg(short, long)]
    url: Option<String>,

    /// Collection backend base URL (overrides config)
    #[arg(short, long)]
    backend: Option<String>,

    /// Camera index or video file for the tracker helper (overrides config)
    #[arg(short, long)]
    source: Option<String>,

    /// Session name (overrides config)
    #[arg(long)]
    session_name: Option<String>,

    /// Disable HTTP server
    #[arg(long)]
    no_http: bool,

    /// HTTP server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Skip fetching user settings from the backend
    #[arg(long)]
    no_settings: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting {} v{}", gazelink::NAME, gazelink::VERSION);

    let config = load_config(&args)?;
    let state = AppState::new(config.clone());

    if config.http.enabled {
        let http_state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = run_http_server(http_state).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    let mut pipeline_task = tokio::spawn(run_gaze_pipeline(Arc::clone(&state)));

    // Session upload happens inside the pipeline task during shutdown
    let result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            state.shutdown();
            (&mut pipeline_task).await
        }
        result = &mut pipeline_task => {
            state.shutdown();
            result
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Pipeline error: {}", e),
        Err(e) => error!("Pipeline task failed: {}", e),
    }

    info!("Gazelink stopped");
    Ok(())
}

/// Load the configuration, apply CLI overrides and validate it
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if let Some(ref path) = args.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    if let Some(ref url) = args.url {
        config.transport.url = url.clone();
    }
    if let Some(ref backend) = args.backend {
        config.backend.base_url = backend.clone();
    }
    if let Some(ref source) = args.source {
        config.tracking.source = source.clone();
    }
    if let Some(ref name) = args.session_name {
        config.session.name = name.clone();
    }
    if args.no_http {
        config.http.enabled = false;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if args.no_settings {
        config.backend.fetch_settings = false;
    }

    config.validate()?;

    info!("Telemetry endpoint: {}", config.transport.url);
    info!("Backend: {}", config.backend.base_url);
    info!("Capture source: {}", config.tracking.source);
    info!("Session strategy: {:?}", config.session.strategy);
    info!("HTTP server: {}", config.http.enabled);

    if config.backend.auth_token.is_none() {
        warn!("No backend token configured; session uploads may be rejected");
    }

    Ok(config)
}

async fn run_gaze_pipeline(state: Arc<AppState>) -> anyhow::Result<()> {
    let config = state.config.read().await.clone();

    // Inference results flow from the transport task into the pipeline task
    let (inference_tx, inference_rx) = mpsc::unbounded_channel();
    let (transport, _transport_task) = TelemetryTransport::spawn(
        config.transport.url.clone(),
        Duration::from_millis(config.transport.reconnect_delay_ms),
        WsConnector::new(),
        Box::new(move |result| {
            let _ = inference_tx.send(result);
        }),
    );

    let mut pipeline = GazePipeline::new(&config, transport)?;

    let client = match SessionClient::new(&config.backend) {
        Ok(client) => Some(client),
        Err(e) => {
            error!("Session uploads disabled: {}", e);
            None
        }
    };

    if let (Some(client), true) = (&client, config.backend.fetch_settings) {
        match client.fetch_user_settings().await {
            Ok(settings) => pipeline.apply_settings(settings),
            Err(e) => warn!("Using default settings: {}", e.message()),
        }
    }

    // Optionally launch the helper
    let subprocess = if config.tracking.auto_launch {
        let mut sp = TrackerSubprocess::new(&config.tracking);
        if let Err(e) = sp.start() {
            error!("Failed to auto-launch landmark tracker: {}", e);
            // Continue anyway, it may be running externally
        }
        Some(sp)
    } else {
        None
    };

    let mut receiver = MpLandmarkReceiver::new(&config.tracking);
    receiver.start().await?;

    info!(
        "Landmark tracking started (port: {}, alignment: {}, smoothing: {})",
        config.tracking.port,
        pipeline.status().alignment,
        config.smoothing.enabled
    );

    let mut runner = PipelineRunner::new(pipeline, receiver, inference_rx, Arc::clone(&state))
        .with_upload_interval(Duration::from_secs(config.session.upload_interval_secs));
    if let Some(client) = client {
        runner = runner.with_client(client);
    }
    if let Some(sp) = subprocess {
        runner = runner.with_subprocess(sp, &config.tracking);
    }

    let pipeline = runner.run().await;
    let status = pipeline.status();
    info!(
        "Pipeline finished ({} frames, {} entries buffered, session: {:?})",
        status.frames_processed, status.buffered_entries, status.session_id
    );

    Ok(())
}

async fn run_http_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let http_config = state.config.read().await.http.clone();

    let web_server = WebServer::new(Arc::clone(&state), &http_config);

    let addr = format!("{}:{}", http_config.host, http_config.port);
    info!("HTTP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let mut shutdown_rx = state.subscribe_shutdown();

    axum::serve(listener, web_server.router())
        .with_graceful_shutdown(async move {
            gazelink::shutdown_requested(&mut shutdown_rx).await;
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
