mod health;
mod metrics;
mod predict_image;
mod predict_video;

use crate::{
    detector::DetectorError, frame_sampler::FrameSamplerError, retention::RetentionError,
    server::SharedState, uploads::UploadError,
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use thiserror::Error;

const HOME_MESSAGE: &str = "Moderation service is running";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Only POST method is allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    MissingFile(&'static str),
    #[error("Failed to read upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Detection(#[from] DetectorError),
    #[error(transparent)]
    Sampling(#[from] FrameSamplerError),
    #[error(transparent)]
    Retention(#[from] RetentionError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::MissingFile(_) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(e) => e.status(),
            ApiError::Upload(_)
            | ApiError::Detection(_)
            | ApiError::Sampling(_)
            | ApiError::Retention(_)
            | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub struct UploadedFile {
    pub file_name: String,
    pub data: Bytes,
}

/// Pulls the first file part called `field_name`. Parts without a file name are
/// plain form values and never count as an upload.
pub async fn read_file_field(
    multipart: Result<Multipart, MultipartRejection>,
    field_name: &str,
    missing: &'static str,
) -> Result<UploadedFile, ApiError> {
    let Ok(mut multipart) = multipart else {
        return Err(ApiError::MissingFile(missing));
    };

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(field_name) {
            continue;
        }
        let Some(file_name) = field.file_name().filter(|name| !name.is_empty()) else {
            continue;
        };
        let file_name = file_name.to_string();
        let data = field.bytes().await?;
        return Ok(UploadedFile { file_name, data });
    }

    Err(ApiError::MissingFile(missing))
}

async fn home() -> &'static str {
    HOME_MESSAGE
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route(
            "/predict",
            post(predict_image::predict_image).fallback(method_not_allowed),
        )
        .route(
            "/predict_video",
            post(predict_video::predict_video).fallback(method_not_allowed),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{SamplingConfig, StorageConfig},
        detection::Detection,
        detector::Detector,
        frame_sampler::write_mjpeg_video,
        retention::ReviewStore,
        telemetry::Metrics,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use serde_json::Value;
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tempfile::TempDir;
    use tonic::async_trait;
    use tower::ServiceExt;

    const BOUNDARY: &str = "moderation-test-boundary";

    struct MockDetector {
        detections: Vec<Detection>,
        fail_after: Option<usize>,
        calls: AtomicUsize,
    }

    impl MockDetector {
        fn returning(detections: Vec<Detection>) -> Self {
            Self {
                detections,
                fail_after: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self::failing_after(0, vec![])
        }

        fn failing_after(calls: usize, detections: Vec<Detection>) -> Self {
            Self {
                detections,
                fail_after: Some(calls),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Detector for MockDetector {
        async fn detect(&self, image_path: &Path) -> Result<Vec<Detection>, DetectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(image_path.exists(), "detector called on missing file");
            if self.fail_after.is_some_and(|limit| call >= limit) {
                return Err(DetectorError::MaxRetriesExceeded);
            }
            Ok(self.detections.clone())
        }
    }

    struct TestApp {
        router: Router,
        root: TempDir,
        detector: Arc<MockDetector>,
    }

    impl TestApp {
        fn new(detector: MockDetector) -> Self {
            let root = tempfile::tempdir().unwrap();
            let storage = StorageConfig {
                upload_dir: root.path().join("uploads"),
                frames_dir: root.path().join("frames"),
                review_dir: root.path().join("review"),
            };
            let detector = Arc::new(detector);
            let state = SharedState {
                detector: detector.clone(),
                review_store: ReviewStore::new(&storage.review_dir, Duration::from_secs(3600)),
                storage,
                sampling: SamplingConfig::default(),
                metrics: Arc::new(Metrics::new().unwrap()),
            };

            Self {
                router: api_routes().with_state(state),
                root,
                detector,
            }
        }

        fn files_in(&self, dir: &str) -> usize {
            std::fs::read_dir(self.root.path().join(dir))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()));
            (status, body)
        }
    }

    fn multipart_request(uri: &str, field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn text_part_request(uri: &str, field: &str, value: &str) -> Request<Body> {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n--{BOUNDARY}--\r\n"
        );

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn video_bytes(fps: f64, frames: usize) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        write_mjpeg_video(&path, fps, frames);
        std::fs::read(path).unwrap()
    }

    #[tokio::test]
    async fn test_home_is_plain_text() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = Request::get("/").body(Body::empty()).unwrap();
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String(HOME_MESSAGE.into()));
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Available");
    }

    #[tokio::test]
    async fn test_predict_flags_exposed_breast() {
        let app = TestApp::new(MockDetector::returning(vec![Detection::new(
            "FEMALE_BREAST_EXPOSED",
            0.92,
        )]));

        let request = multipart_request("/predict", "image", "photo.jpg", b"jpeg bytes");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["explicit_content"], true);
        let details = body["details"].as_array().unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0]["class"], "FEMALE_BREAST_EXPOSED");
        assert_eq!(details[0]["score_percentage"], 92.0);
        assert_eq!(details[0]["explicit"], true);
        assert_eq!(app.files_in("uploads"), 0);
    }

    #[tokio::test]
    async fn test_predict_ignores_non_sensitive_labels() {
        let app = TestApp::new(MockDetector::returning(vec![Detection::new(
            "FACE_FEMALE",
            0.99,
        )]));

        let request = multipart_request("/predict", "image", "photo.jpg", b"jpeg bytes");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["explicit_content"], false);
        assert_eq!(body["details"], Value::Array(vec![]));
    }

    #[tokio::test]
    async fn test_predict_without_image_field() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = multipart_request("/predict", "file", "photo.jpg", b"jpeg bytes");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({ "error": "No image provided" }));
        assert_eq!(app.detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predict_text_part_is_not_an_image() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = text_part_request("/predict", "image", "hello");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({ "error": "No image provided" }));
        assert_eq!(app.detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(app.files_in("uploads"), 0);
    }

    #[tokio::test]
    async fn test_predict_empty_file_name_is_not_an_image() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = multipart_request("/predict", "image", "", b"");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No image provided");
        assert_eq!(app.detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predict_without_multipart_body() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = Request::post("/predict").body(Body::empty()).unwrap();
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No image provided");
    }

    #[tokio::test]
    async fn test_predict_rejects_get() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = Request::get("/predict").body(Body::empty()).unwrap();
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"], "Only POST method is allowed");
    }

    #[tokio::test]
    async fn test_predict_detector_failure_is_server_error() {
        let app = TestApp::new(MockDetector::failing());

        let request = multipart_request("/predict", "image", "photo.jpg", b"jpeg bytes");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Maximum connection retries exceeded.");
        assert_eq!(app.files_in("uploads"), 0);
    }

    #[tokio::test]
    async fn test_predict_video_without_video_field() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = multipart_request("/predict_video", "image", "clip.avi", b"avi");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({ "error": "No video file provided" }));
    }

    #[tokio::test]
    async fn test_predict_video_text_part_is_not_a_video() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = text_part_request("/predict_video", "video", "hello");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({ "error": "No video file provided" }));
        assert_eq!(app.files_in("uploads"), 0);
        assert_eq!(app.files_in("frames"), 0);
    }

    #[tokio::test]
    async fn test_predict_video_rejects_get() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request = Request::get("/predict_video").body(Body::empty()).unwrap();
        let (status, _) = app.send(request).await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_predict_video_unreadable_video_is_reported() {
        let app = TestApp::new(MockDetector::returning(vec![]));

        let request =
            multipart_request("/predict_video", "video", "clip.mp4", b"definitely not a video");
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to open video"));
        assert_eq!(app.files_in("uploads"), 0);
        assert_eq!(app.files_in("frames"), 0);
    }

    #[tokio::test]
    async fn test_predict_video_retains_flagged_frames() {
        let app = TestApp::new(MockDetector::returning(vec![
            Detection::new("BUTTOCKS_EXPOSED", 0.81),
            Detection::new("FACE_MALE", 0.95),
        ]));

        let request =
            multipart_request("/predict_video", "video", "clip.avi", &video_bytes(10.0, 20));
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["explicit_detected"], true);
        let flagged = body["flagged_timestamps"].as_array().unwrap();
        let timestamps: Vec<&str> = flagged
            .iter()
            .map(|f| f["timestamp"].as_str().unwrap())
            .collect();
        assert_eq!(timestamps, vec!["0.00", "1.00"]);
        for item in flagged {
            assert_eq!(item["class"], "BUTTOCKS_EXPOSED");
            assert_eq!(item["score_percentage"], 81.0);
            let frame_path = Path::new(item["frame_path"].as_str().unwrap());
            assert!(frame_path.starts_with(app.root.path().join("review")));
            assert!(frame_path.exists());
        }
        assert_eq!(app.detector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(app.files_in("review"), 2);
        assert_eq!(app.files_in("uploads"), 0);
        assert_eq!(app.files_in("frames"), 0);
    }

    #[tokio::test]
    async fn test_predict_video_failure_releases_retained_frames() {
        let app = TestApp::new(MockDetector::failing_after(
            1,
            vec![Detection::new("MALE_GENITALIA_EXPOSED", 0.77)],
        ));

        let request =
            multipart_request("/predict_video", "video", "clip.avi", &video_bytes(10.0, 20));
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Maximum connection retries exceeded.");
        assert_eq!(app.detector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(app.files_in("review"), 0);
        assert_eq!(app.files_in("uploads"), 0);
        assert_eq!(app.files_in("frames"), 0);
    }

    #[tokio::test]
    async fn test_predict_video_discards_clean_frames() {
        let app = TestApp::new(MockDetector::returning(vec![Detection::new(
            "FEET_EXPOSED",
            0.9,
        )]));

        let request =
            multipart_request("/predict_video", "video", "clip.avi", &video_bytes(10.0, 20));
        let (status, body) = app.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["explicit_detected"], false);
        assert_eq!(body["flagged_timestamps"], Value::Array(vec![]));
        assert_eq!(app.files_in("review"), 0);
        assert_eq!(app.files_in("frames"), 0);
    }
}
