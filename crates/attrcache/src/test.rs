//! Helpers for testing the web server.

use attrcache_service::config::{Config, FetcherConfig};
use attrcache_service::services::create_service;

pub use attrcache_test::*;

use crate::endpoints;

/// Serves the given documents from a [`SourceServer`] and runs the app against it.
///
/// Both servers stop when dropped, so hold on to them for the entire test.
pub fn server_with_sources(documents: &[(u32, &str)]) -> (SourceServer, Server) {
    let sources = SourceServer::new();
    for (id, document) in documents {
        sources.insert(*id, document);
    }

    let config = Config {
        source: FetcherConfig::Http {
            url: sources.url_template(),
        },
        ..Default::default()
    };
    let service = create_service(&config).unwrap();
    let server = Server::with_router(endpoints::create_app(service));

    (sources, server)
}
