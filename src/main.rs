use zlink::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,zlink=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = zlink::app::load_state().await?;
    let app = zlink::app::build_app(state.clone());
    let addr: std::net::SocketAddr = state
        .runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| {
            AppError::internal("listen_invalid", err.to_string())
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::internal("listen_failed", err.to_string()))?;
    let runtime = &state.runtime;
    let upstream_token = if runtime.upstream.token.is_some() {
        "configured"
    } else if runtime.upstream.anonymous_token {
        "anonymous"
    } else {
        "none"
    };
    tracing::info!(
        listen = %addr,
        upstream = %runtime.upstream.base_url,
        metrics_path = %runtime.metrics_path,
        upstream_token,
        "zlink proxy listening"
    );
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::internal("serve_failed", err.to_string()))?;
    Ok(())
}
