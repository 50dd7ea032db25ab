use std::net::SocketAddr;

use anyhow::{Context, Result};

use attrcache_service::config::Config;
use attrcache_service::metric;
use attrcache_service::services::create_service;

use crate::endpoints;

/// Creates the service and serves it over HTTP on the configured address.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("attrcache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .context("invalid bind address")?;

    runtime.block_on(async {
        let service = create_service(&config).context("failed to create service state")?;
        let app = endpoints::create_app(service);

        tracing::info!("Starting HTTP server on {}", socket);
        axum_server::bind(socket)
            .serve(app.into_make_service())
            .await
            .context("HTTP server failed")
    })?;
    tracing::info!("System shutdown complete");

    Ok(())
}
