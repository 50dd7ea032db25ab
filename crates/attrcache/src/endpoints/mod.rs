use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use attrcache_service::metric;
use attrcache_service::services::AttributesService;

mod attributes;
mod cache;
mod error;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

use attributes::{compute_attributes, compute_rating};
use cache::purge_cache;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: AttributesService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(DefaultBodyLimit::max(1024 * 1024));
    Router::new()
        .route("/attributes", post(compute_attributes))
        .route("/rating", post(compute_rating))
        .route("/cache", delete(purge_cache))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::test;

    #[tokio::test]
    async fn test_healthcheck() {
        test::setup();
        let (_sources, server) = test::server_with_sources(&[]);

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
