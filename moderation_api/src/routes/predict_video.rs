use super::{read_file_field, ApiError};
use crate::{
    content_filter,
    frame_sampler::{self, FrameSample},
    server::SharedState,
    uploads,
};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde::Serialize;
use std::{path::PathBuf, time::Instant};
use tracing::instrument;

const ROUTE: &str = "/predict_video";

#[derive(Debug, Serialize)]
pub struct FlaggedTimestamp {
    pub timestamp: String,
    pub class: String,
    pub score_percentage: f64,
    pub frame_path: String,
    #[serde(rename = "box")]
    pub region: [f32; 4],
}

#[derive(Debug, Serialize)]
pub struct VideoVerdict {
    pub flagged_timestamps: Vec<FlaggedTimestamp>,
    pub explicit_detected: bool,
}

/// Samples the upload, classifies every sample and keeps only frames that were flagged.
/// A failed request releases whatever it had already retained.
#[instrument(skip(state, multipart))]
pub async fn predict_video(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoVerdict>, ApiError> {
    state.metrics.record_request(ROUTE);

    let upload = read_file_field(multipart, "video", "No video file provided").await?;
    let request_id = uploads::new_request_id();
    let video = uploads::persist(
        &state.storage.upload_dir,
        "video",
        Some(upload.file_name.as_str()),
        upload.data,
    )
    .await?;
    let workspace = uploads::frame_workspace(&state.storage.frames_dir, &request_id)?;

    let video_path = video.path().to_path_buf();
    let output_dir = workspace.path().to_path_buf();
    let interval = state.sampling.frame_interval_secs;
    let frames = tokio::task::spawn_blocking(move || {
        frame_sampler::sample(&video_path, interval, &output_dir)
    })
    .await??;
    state.metrics.record_frames_sampled(frames.len() as u64);

    let mut retained_frames = Vec::new();
    let outcome = classify_frames(&state, &frames, &request_id, &mut retained_frames).await;

    drop(workspace);
    if let Err(e) = video.close() {
        tracing::warn!("Failed to remove uploaded video: {}", e);
    }

    let flagged_timestamps = match outcome {
        Ok(flagged_timestamps) => flagged_timestamps,
        Err(e) => {
            state.review_store.release(&retained_frames).await;
            return Err(e);
        }
    };

    tracing::info!(
        "Video {} sampled {} frames, {} flagged",
        request_id,
        frames.len(),
        retained_frames.len()
    );

    Ok(Json(VideoVerdict {
        flagged_timestamps,
        explicit_detected: !retained_frames.is_empty(),
    }))
}

/// Runs detection on every sample in order. Flagged frames are moved into the
/// review store and recorded in `retained` as they go.
async fn classify_frames(
    state: &SharedState,
    frames: &[FrameSample],
    request_id: &str,
    retained: &mut Vec<PathBuf>,
) -> Result<Vec<FlaggedTimestamp>, ApiError> {
    let mut flagged_timestamps = Vec::new();

    for frame in frames {
        let started = Instant::now();
        let detections = state.detector.detect(&frame.path).await?;
        state
            .metrics
            .record_detection_duration(started.elapsed().as_millis() as u64, ROUTE);

        let flagged = content_filter::explicit_content(&detections);
        if flagged.is_empty() {
            if let Err(e) = tokio::fs::remove_file(&frame.path).await {
                tracing::warn!("Failed to remove frame {:?}: {}", frame.path, e);
            }
            continue;
        }

        let frame_path = state.review_store.retain(&frame.path, request_id).await?;
        tracing::info!(
            "Frame {} at {}s flagged {} times, retained at {:?}",
            frame.frame_index,
            frame.timestamp,
            flagged.len(),
            frame_path
        );
        state.metrics.record_flagged(flagged.len() as u64, ROUTE);

        let display_path = frame_path.display().to_string();
        retained.push(frame_path);
        flagged_timestamps.extend(flagged.into_iter().map(|item| FlaggedTimestamp {
            timestamp: frame.timestamp.clone(),
            class: item.label,
            score_percentage: item.score_percentage,
            frame_path: display_path.clone(),
            region: item.region,
        }));
    }

    Ok(flagged_timestamps)
}
