use super::{read_file_field, ApiError};
use crate::{
    content_filter::{self, FlaggedDetection},
    server::SharedState,
    uploads,
};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/predict";

#[derive(Debug, Serialize)]
pub struct ImageVerdict {
    pub details: Vec<FlaggedDetection>,
    pub explicit_content: bool,
}

#[instrument(skip(state, multipart))]
pub async fn predict_image(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ImageVerdict>, ApiError> {
    state.metrics.record_request(ROUTE);

    let upload = read_file_field(multipart, "image", "No image provided").await?;
    let image = uploads::persist(
        &state.storage.upload_dir,
        "image",
        Some(upload.file_name.as_str()),
        upload.data,
    )
    .await?;

    let started = Instant::now();
    let detections = state.detector.detect(image.path()).await?;
    state
        .metrics
        .record_detection_duration(started.elapsed().as_millis() as u64, ROUTE);

    if let Err(e) = image.close() {
        tracing::warn!("Failed to remove uploaded image: {}", e);
    }

    let details = content_filter::explicit_content(&detections);
    state.metrics.record_flagged(details.len() as u64, ROUTE);
    tracing::info!(
        "Image produced {} detections, {} flagged",
        detections.len(),
        details.len()
    );

    Ok(Json(ImageVerdict {
        explicit_content: !details.is_empty(),
        details,
    }))
}
