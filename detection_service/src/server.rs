use crate::{
    config::Config,
    inference_service::InferenceService,
    model_service::ModelService,
    ort_service::OrtModelService,
    state::{ServiceState, State},
};
use nudity_proto::nudity_service_server::NudityServiceServer;
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;

const MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;

pub struct GrpcServer {
    router: Router,
    addr: String,
}

impl GrpcServer {
    pub async fn new<M: ModelService, S: State>(
        model_service: M,
        service_state: S,
        addr: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inference_service = InferenceService::new(model_service, service_state);
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(nudity_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<NudityServiceServer<InferenceService<M, S>>>()
            .await;

        let router = Server::builder()
            .add_service(health_service)
            .add_service(
                NudityServiceServer::new(inference_service)
                    .max_decoding_message_size(MAX_IMAGE_BYTES),
            )
            .add_service(reflection_service);

        Ok(Self {
            router,
            addr: addr.to_string(),
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.addr.parse()?;

        tracing::info!("Detection service listening on {}", self.addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let ort_model_service = OrtModelService::new(&config.model)?;
    let service_state = ServiceState::new(&config.labels)?;
    tracing::info!("Loaded {} class labels", service_state.get_labels().len());

    let addr = config.server.get_address();
    let grpc_server = GrpcServer::new(ort_model_service, service_state, &addr).await?;

    grpc_server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
