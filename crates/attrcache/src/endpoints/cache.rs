use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use attrcache_service::services::AttributesService;
use attrcache_service::types::SourceId;

/// Query parameters of the purge request.
#[derive(Debug, Deserialize)]
pub struct PurgeQueryParams {
    /// The source to purge. Everything is purged if this is missing.
    #[serde(default)]
    pub source_id: Option<SourceId>,
}

pub async fn purge_cache(
    State(service): State<AttributesService>,
    Query(params): Query<PurgeQueryParams>,
) -> StatusCode {
    match params.source_id {
        Some(source_id) => tracing::info!(%source_id, "purging source"),
        None => tracing::info!("purging all sources"),
    }
    service.purge(params.source_id);
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use reqwest::{Client, StatusCode};
    use serde_json::json;

    use crate::test;

    async fn rating(client: &Client, server: &test::Server, source_id: u32) -> f64 {
        client
            .post(server.url("/rating"))
            .json(&json!({"sourceId": source_id, "domainId": 0}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_purge_source() {
        test::setup();
        let (sources, server) = test::server_with_sources(&[(42, "one\n"), (43, "one\n")]);
        let client = Client::new();

        assert_eq!(rating(&client, &server, 42).await, 1.0);
        assert_eq!(rating(&client, &server, 43).await, 1.0);
        assert_eq!(sources.accesses(), 2);

        sources.insert(42, "one\ntwo\n");
        sources.insert(43, "one\ntwo\n");
        // cached until purged
        assert_eq!(rating(&client, &server, 42).await, 1.0);
        assert_eq!(sources.accesses(), 0);

        let response = client
            .delete(server.url("/cache?source_id=42"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(rating(&client, &server, 42).await, 2.0);
        assert_eq!(rating(&client, &server, 43).await, 1.0);
        assert_eq!(sources.accesses(), 1);
    }

    #[tokio::test]
    async fn test_purge_unknown_source() {
        test::setup();
        let (_sources, server) = test::server_with_sources(&[]);

        // purging is idempotent and always succeeds
        for _ in 0..2 {
            let response = Client::new()
                .delete(server.url("/cache?source_id=1234"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_purge_all() {
        test::setup();
        let (sources, server) = test::server_with_sources(&[(42, "one\n"), (43, "one\n")]);
        let client = Client::new();

        rating(&client, &server, 42).await;
        rating(&client, &server, 43).await;
        sources.insert(42, "one\ntwo\n");
        sources.insert(43, "one\ntwo\nthree\n");

        let response = client.delete(server.url("/cache")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(rating(&client, &server, 42).await, 2.0);
        assert_eq!(rating(&client, &server, 43).await, 3.0);
    }
}
