use crate::{model_service::ModelService, state::State};
use nudity_proto::{
    nudity_service_server::NudityService, ClassLabels, DetectionBatch, Empty, ImageFrame,
};
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status};

#[derive(Debug, Clone)]
pub struct InferenceService<M: ModelService, S: State> {
    model_service: Arc<M>,
    service_state: Arc<S>,
}

impl<M: ModelService, S: State> InferenceService<M, S> {
    pub fn new(model_service: M, state: S) -> Self {
        Self {
            model_service: Arc::new(model_service),
            service_state: Arc::new(state),
        }
    }
}

#[async_trait]
impl<M: ModelService, S: State> NudityService for InferenceService<M, S> {
    async fn detect(
        &self,
        request: Request<ImageFrame>,
    ) -> Result<Response<DetectionBatch>, Status> {
        let image_frame = request.into_inner();
        let model_service = self.model_service.clone();
        let batch = model_service.detect(image_frame).await?;

        let labels = self.service_state.get_labels();
        tracing::debug!("Returning {} detections", batch.detections.len());
        for (i, detection) in batch.detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class={}, confidence={:.3}, box=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                labels
                    .get(detection.class_id as usize)
                    .map(String::as_str)
                    .unwrap_or("unknown"),
                detection.confidence,
                detection.x,
                detection.y,
                detection.width,
                detection.height
            );
        }

        Ok(Response::new(batch))
    }

    async fn get_class_labels(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ClassLabels>, Status> {
        let labels = self.service_state.get_labels().clone();

        Ok(Response::new(ClassLabels { labels }))
    }
}
