use std::sync::Arc;

use axum::extract::{Json, State};

use attrcache_service::services::AttributesService;
use attrcache_service::types::{Attributes, AttributesRequest};

use super::ResponseError;

fn configure_scope(request: &AttributesRequest) {
    sentry::configure_scope(|scope| {
        scope.set_tag("request.source", request.source_id);
        scope.set_tag("request.domain", request.domain_id);
    });
}

pub async fn compute_attributes(
    State(service): State<AttributesService>,
    Json(request): Json<AttributesRequest>,
) -> Result<Json<Arc<Attributes>>, ResponseError> {
    configure_scope(&request);
    let attributes = service.compute(&request).await?;
    Ok(Json(attributes))
}

/// Like [`compute_attributes`], but responds with the rating only.
pub async fn compute_rating(
    State(service): State<AttributesService>,
    Json(request): Json<AttributesRequest>,
) -> Result<Json<f64>, ResponseError> {
    configure_scope(&request);
    let attributes = service.compute(&request).await?;
    Ok(Json(attributes.rating))
}
