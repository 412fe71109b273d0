use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use workspace_auth_gateway::config::{Config, LogFormat};
use workspace_auth_gateway::middleware::{request_id_middleware, security_headers_middleware};
use workspace_auth_gateway::observability::init_tracing;
use workspace_auth_gateway::routes::{dispatch, health};
use workspace_auth_gateway::state::AppState;

#[derive(Parser, Debug)]
#[command(
    name = "workspace-auth-gateway",
    about = "Authentication and authorization edge service for per-workspace notebook traffic"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides the configured log format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Print the configuration file's JSON Schema to stdout and exit,
    /// without reading `--config` or touching the network.
    #[cfg(feature = "json-schema")]
    #[arg(long)]
    print_schema: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    #[cfg(feature = "json-schema")]
    if args.print_schema {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let mut config = Config::from_file(&args.config)?;
    if let Some(log_format) = args.log_format {
        config.observability.log_format = log_format;
    }

    let _tracing_guard = init_tracing(&config.observability)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown_timeout_secs = config.server.shutdown_timeout_secs;
    let bind_addr = config.server.bind_addr.clone();
    let enable_oauth = config.features.enable_oauth;
    let enable_bearer_url_auth = config.features.enable_bearer_url_auth;

    let state =
        Arc::new(AppState::new(config).map_err(|e| format!("failed to build state: {e}"))?);

    // Provider discovery runs off the request path; a failure here does not
    // crash the process so `/health` can report "not ready" instead.
    let oidc = state.oidc.clone();
    tokio::spawn(async move {
        if let Err(e) = oidc.start().await {
            tracing::error!(reason = %e, "OIDC verifier failed to start");
        } else {
            tracing::info!("OIDC verifier ready");
        }
    });

    let mut router = Router::new().route("/health", get(health::health));

    if enable_oauth {
        router = router.route("/auth", get(dispatch::auth));
    }
    if enable_bearer_url_auth {
        router = router.route("/bearer-auth", get(dispatch::bearer_auth));
    }
    // CSRF protection wraps /verify only: /auth and /bearer-auth are
    // first-contact/bootstrap endpoints with no CSRF token yet, and /health
    // is monitoring-only.
    router = router.route("/verify", get(dispatch::verify));

    let app = router
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_timeout_secs))
        .await?;

    Ok(())
}

async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(
        timeout_secs,
        "shutdown signal received, draining in-flight requests"
    );
}
