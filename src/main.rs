use std::sync::Arc;

use stdio_sse_bridge::{
    build_app,
    config::Config,
    dispatcher, logging,
    registry::{PendingRegistry, SessionRegistry},
    subprocess::{ChildPipes, Subprocess},
    AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let (subprocess, pipes) = Subprocess::spawn(&config)?;

    let result = run(&config, Arc::clone(&subprocess), pipes).await;

    // Once the child exists it is torn down exactly once, whichever way the
    // server stops: clean shutdown, bind failure, or serve error.
    subprocess.shutdown(config.shutdown_grace).await;
    result
}

async fn run(
    config: &Config,
    subprocess: Arc<Subprocess>,
    pipes: ChildPipes,
) -> Result<(), Box<dyn std::error::Error>> {
    let pending = Arc::new(PendingRegistry::new());
    let sessions = Arc::new(SessionRegistry::new());

    tokio::spawn(dispatcher::run_stdout_loop(
        pipes.stdout,
        Arc::clone(&pending),
        Arc::clone(&subprocess),
    ));
    tokio::spawn(dispatcher::run_stderr_drain(pipes.stderr));
    if let Some(bound) = config.request_timeout {
        tokio::spawn(dispatcher::run_expiry_sweep(Arc::clone(&pending), bound));
    }

    let state = AppState::new(subprocess, sessions, pending);
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(config.bind_socket()?).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        child = %config.child_command,
        "bridge starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
