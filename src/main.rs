use std::net::SocketAddr;

use portcullis::{
    error::StartupError,
    grpc::proto::{
        auth_service_server::AuthServiceServer, workspace_service_server::WorkspaceServiceServer,
    },
    init_telemetry, shutdown_telemetry, App, Config, Stores,
};
use tonic::transport::Server as TonicServer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    init_telemetry(&config);

    if let Err(e) = run(config).await {
        error!(error = %e, "Server terminated with error");
        shutdown_telemetry();
        std::process::exit(1);
    }

    shutdown_telemetry();
}

async fn run(config: Config) -> Result<(), StartupError> {
    info!(
        service = "portcullis",
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.server.environment,
        "Starting server"
    );

    for issue in config.validate_for_production() {
        warn!(issue = %issue, "Configuration warning");
    }

    let stores = Stores::connect(&config)?;
    let app = App::build(&config, stores)?;

    let maintenance = app.maintenance_task();
    let maintenance_handle = maintenance.spawn();

    let http_addr = config.http_addr();
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: http_addr.clone(),
            source,
        })?;
    info!(http_address = %http_addr, "HTTP health server ready");

    let grpc_addr: SocketAddr =
        config
            .grpc_addr()
            .parse()
            .map_err(|e: std::net::AddrParseError| StartupError::Bind {
                addr: config.grpc_addr(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?;
    info!(grpc_address = %grpc_addr, "gRPC server ready");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let http_server = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let router = app.router();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
        }
    };

    let grpc_server = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let auth_service = app.auth_service();
        let workspace_service = app.workspace_service();
        async move {
            TonicServer::builder()
                .add_service(AuthServiceServer::new(auth_service))
                .add_service(WorkspaceServiceServer::new(workspace_service))
                .serve_with_shutdown(grpc_addr, async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
        }
    };

    let http_task = tokio::spawn(http_server);
    let grpc_task = tokio::spawn(grpc_server);

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            Ok(())
        }
        joined = wait_for_exit("http", http_task) => joined,
        joined = wait_for_exit("grpc", grpc_task) => joined,
    };

    let _ = shutdown_tx.send(());

    if let Some(handle) = maintenance_handle {
        info!("Stopping maintenance task");
        handle.stop().await;
    }

    info!("Server shutdown complete");
    outcome
}

/// Resolves only if a server stops on its own, which is always a failure.
async fn wait_for_exit<E: std::fmt::Display>(
    name: &'static str,
    task: tokio::task::JoinHandle<Result<(), E>>,
) -> Result<(), StartupError> {
    match task.await {
        Ok(Ok(())) => Err(StartupError::Serve(format!("{} server exited", name))),
        Ok(Err(e)) => Err(StartupError::Serve(format!("{} server: {}", name, e))),
        Err(e) => Err(StartupError::Serve(format!("{} server task: {}", name, e))),
    }
}
