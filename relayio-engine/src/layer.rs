use tower::Layer;

use crate::{config::EngineConfig, handler::SessionHandler, service::EngineService};

/// A [`tower::Layer`] that mounts the engine in front of any inner service.
#[derive(Debug, Clone)]
pub struct EngineLayer<H: SessionHandler + Clone> {
    config: EngineConfig,
    handler: H,
}

impl<H: SessionHandler + Clone> EngineLayer<H> {
    pub fn new(handler: H) -> Self {
        Self {
            config: EngineConfig::default(),
            handler,
        }
    }

    pub fn from_config(handler: H, config: EngineConfig) -> Self {
        Self { config, handler }
    }
}

impl<S: Clone, H: SessionHandler + Clone> Layer<S> for EngineLayer<H> {
    type Service = EngineService<H, S>;

    fn layer(&self, inner: S) -> Self::Service {
        EngineService::with_config_inner(inner, self.handler.clone(), self.config.clone())
    }
}
