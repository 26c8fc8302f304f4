use nudity_proto::{DetectionBatch, ImageFrame};
use tonic::{async_trait, Status};

#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn detect(&self, frame: ImageFrame) -> Result<DetectionBatch, Status>;
}
