use std::sync::Arc;

use tower::Layer;

use crate::{
    adapter::{Adapter, LocalAdapter},
    client::Client,
    service::RelayIoService,
};

/// A tower [`Layer`] mounting the relayio server in front of any inner
/// service.
pub struct RelayIoLayer<A: Adapter = LocalAdapter> {
    client: Arc<Client<A>>,
}

impl<A: Adapter> RelayIoLayer<A> {
    pub(crate) fn from_client(client: Arc<Client<A>>) -> Self {
        Self { client }
    }
}

impl<A: Adapter> Clone for RelayIoLayer<A> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<S: Clone, A: Adapter> Layer<S> for RelayIoLayer<A> {
    type Service = RelayIoService<S, A>;

    fn layer(&self, inner: S) -> Self::Service {
        RelayIoService::with_client(inner, self.client.clone())
    }
}
