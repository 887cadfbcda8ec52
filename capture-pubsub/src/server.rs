use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::api::ProcessorError;
use crate::config::Config;
use crate::processor::{PubsubProcessor, ServiceAccountClientFactory};
use crate::router;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("failed to initialize processor: {0}")]
    Init(#[from] ProcessorError),
    #[error("http server failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialize the processor from `config` and serve it on `listener` until
/// `shutdown` resolves. The processor is shut down once the server has
/// drained its connections.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let factory = ServiceAccountClientFactory {
        options: config.client_options(),
    };

    let mut processor = PubsubProcessor::new();
    processor
        .init(
            &config.processor_params(),
            config.third_party_cookies,
            &factory,
        )
        .await?;
    let processor = Arc::new(processor);

    let app = router::router(processor.clone(), config.export_prometheus);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    processor.flush();
    processor.shutdown();

    Ok(served?)
}
