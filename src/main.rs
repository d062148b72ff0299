use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whisper::api::{self, AppState};
use whisper::config::{self, Config};
use whisper::store::schema::ValidatedConfig;
use whisper::store::Store;
use whisper::vault::SecretService;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Traces go to stdout, and to an OTLP collector when
    // OTEL_EXPORTER_OTLP_ENDPOINT is set.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "whisper"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "whisper=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let args = cli::Cli::parse();
    let cfg = config::load()?;

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Sweep) => run_sweep(cfg).await,
        Some(cli::Commands::CheckConfig) => check_config(&cfg),
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

async fn run_server(cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    tracing::info!(storage_class = %cfg.storage_class, "starting store...");
    let store = Store::start(
        cfg.storage_class,
        &cfg.storage_config,
        cfg.storage_clean_interval,
    )
    .await
    .context("failed to start store")?;
    tracing::info!(
        interval_secs = cfg.storage_clean_interval.as_secs(),
        "background cleaner started"
    );

    let state = Arc::new(AppState {
        service: SecretService::new(store.clone(), cfg.secret_key.clone(), cfg.bcrypt_cost),
        max_data_size_mb: cfg.max_data_size_mb,
    });
    let app = api::router(state);

    let addr = SocketAddr::new(cfg.app_listen_ip, port.unwrap_or(cfg.app_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("whisper listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, stopping cleaner...");
    store.shutdown().await;
    Ok(())
}

async fn run_sweep(cfg: Config) -> anyhow::Result<()> {
    let store = Store::open(cfg.storage_class, &cfg.storage_config)
        .await
        .context("failed to open store")?;
    let report = store.delete_expired().await;
    println!(
        "scanned {} secrets, deleted {}, failed {}",
        report.scanned, report.deleted, report.failed
    );
    if report.failed > 0 {
        anyhow::bail!("{} secrets could not be swept", report.failed);
    }
    Ok(())
}

/// Validate backend options without touching the backend.
fn check_config(cfg: &Config) -> anyhow::Result<()> {
    let kind = cfg.storage_class;
    let validated = ValidatedConfig::validate(kind.schema(), &cfg.storage_config)?;
    kind.build(&validated)?;
    println!("configuration OK");
    println!("  storage_class:          {}", kind);
    for option in kind.schema() {
        let value = validated.get(option.name);
        let shown = if option.name.contains("secret") && !value.is_empty() {
            "****"
        } else {
            value
        };
        println!("  storage_config.{:<24}{}", option.name, shown);
    }
    println!(
        "  storage_clean_interval: {}s",
        cfg.storage_clean_interval.as_secs()
    );
    println!("  max_data_size_mb:       {}", cfg.max_data_size_mb);
    println!("  listen:                 {}:{}", cfg.app_listen_ip, cfg.app_port);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
