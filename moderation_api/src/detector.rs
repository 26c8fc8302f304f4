use crate::config::DetectionServiceConfig;
use crate::detection::Detection;
use nudity_proto::{nudity_service_client::NudityServiceClient, Empty, ImageFrame};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tonic::{async_trait, transport::Channel, Request, Status};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to connect to detection service: {0}")]
    ConnectionFailed(#[from] tonic::transport::Error),
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
    #[error("Detection request failed: {0}")]
    GrpcRequestFailed(#[from] Status),
    #[error("Failed to read image {path:?}: {source}")]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Classifies the image stored at a path. Shared by every in-flight request.
#[async_trait]
pub trait Detector: Send + Sync + 'static {
    async fn detect(&self, image_path: &Path) -> Result<Vec<Detection>, DetectorError>;
}

pub struct GrpcDetector {
    client: NudityServiceClient<Channel>,
    class_labels: Vec<String>,
}

impl GrpcDetector {
    pub async fn new(config: &DetectionServiceConfig) -> Result<Self, DetectorError> {
        let mut client = Self::get_client(config.get_address()).await?;

        let response = client.get_class_labels(Request::new(Empty {})).await?;
        let class_labels = response.into_inner().labels;
        tracing::info!("Detection service reports {} classes", class_labels.len());

        Ok(Self {
            client,
            class_labels,
        })
    }

    async fn get_client(address: String) -> Result<NudityServiceClient<Channel>, DetectorError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let max_retries = 10;
        let mut retry_count = 0;

        while retry_count < max_retries {
            match timeout(
                Duration::from_secs(1),
                NudityServiceClient::connect(address.clone()),
            )
            .await
            {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to detection service: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            retry_count += 1;
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(DetectorError::MaxRetriesExceeded)
    }
}

fn label_for(class_labels: &[String], class_id: u32) -> String {
    class_labels
        .get(class_id as usize)
        .cloned()
        .unwrap_or_else(|| format!("UNKNOWN_CLASS_{}", class_id))
}

#[async_trait]
impl Detector for GrpcDetector {
    #[instrument(skip(self))]
    async fn detect(&self, image_path: &Path) -> Result<Vec<Detection>, DetectorError> {
        let image_data =
            tokio::fs::read(image_path)
                .await
                .map_err(|source| DetectorError::ReadImage {
                    path: image_path.to_path_buf(),
                    source,
                })?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        // Channels are cheap to clone and multiplex concurrent calls.
        let mut client = self.client.clone();
        let response = client
            .detect(Request::new(ImageFrame {
                image_data,
                timestamp,
            }))
            .await?;

        let detections = response
            .into_inner()
            .detections
            .into_iter()
            .map(|d| Detection {
                label: label_for(&self.class_labels, d.class_id),
                confidence: d.confidence,
                region: [d.x, d.y, d.width, d.height],
            })
            .collect::<Vec<_>>();

        tracing::debug!("Received {} detections", detections.len());
        Ok(detections)
    }
}
