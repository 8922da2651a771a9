use axum::http::StatusCode;
use chatrelay::app::{build_app, load_state};
use chatrelay::error::AppError;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chatrelay=debug")),
        )
        .json()
        .init();

    if let Err(err) = serve().await {
        eprintln!("chatrelay: {} ({})", err.message, err.code);
        std::process::exit(1);
    }
}

async fn serve() -> Result<(), AppError> {
    let state = load_state().await?;
    let addr = state.runtime.listen.parse::<SocketAddr>().map_err(|err| {
        startup_error(
            "listen_invalid",
            format!("{}: {err}", state.runtime.listen),
        )
    })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err.to_string()))?;

    tracing::info!(
        %addr,
        metrics_path = %state.runtime.metrics_path,
        system_prompt = state.runtime.system_prompt.is_some(),
        "chatrelay listening"
    );
    axum::serve(listener, build_app(state))
        .await
        .map_err(|err| startup_error("serve_failed", err.to_string()))
}

fn startup_error(code: &str, message: String) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}
