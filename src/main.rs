use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use pagefront::{
    cache::{CacheEngine, CacheState, MemoryStore},
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState, PublicState},
        origin::HttpOrigin,
        telemetry,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let store = Arc::new(MemoryStore::new(&settings.cache));
    let engine = Arc::new(CacheEngine::builder(settings.cache.clone(), store).build());
    let origin = Arc::new(HttpOrigin::new(
        &settings.origin,
        settings.cache.max_body_bytes,
    )?);

    info!(
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        upstream = %origin.upstream(),
        cache_enabled = settings.cache.enabled,
        policies = ?engine.chain().names(),
        "starting pagefront"
    );

    let public_router = http::build_public_router(
        PublicState { origin },
        CacheState::new(Arc::clone(&engine)),
    );
    let admin_router = http::build_admin_router(AdminState { engine });

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let public_server = axum::serve(
        public_listener,
        public_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    let admin_server = axum::serve(
        admin_listener,
        admin_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for(shutdown_rx));

    let servers = async {
        try_join!(public_server, admin_server)
            .map_err(|err| InfraError::Server(err.to_string()))
    };
    tokio::pin!(servers);

    tokio::select! {
        result = &mut servers => return result.map(|_| ()),
        () = shutdown_signal() => {}
    }

    info!(grace = ?settings.server.graceful_shutdown, "shutting down");
    let _ = shutdown_tx.send(true);
    drain(servers, settings.server.graceful_shutdown).await
}

async fn drain<F>(servers: F, grace: Duration) -> Result<(), InfraError>
where
    F: std::future::Future<Output = Result<((), ()), InfraError>>,
{
    match tokio::time::timeout(grace, servers).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => {
            warn!(grace = ?grace, "graceful shutdown timed out; dropping open connections");
            Ok(())
        }
    }
}

async fn wait_for(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
