pub mod failure;
pub mod fingerprint;
pub mod http;
pub mod listener;
pub mod registry;
pub mod rewrite;
pub mod sniff;
pub mod store;
pub mod translate;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;
use rustls::ClientConfig;

use crate::settings::Settings;
use registry::InFlightRegistry;
use store::ObjectStore;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: Arc<ObjectStore>,
    pub registry: InFlightRegistry,
    pub tls: Arc<TlsContext>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<ObjectStore>,
        registry: InFlightRegistry,
        tls: Arc<TlsContext>,
    ) -> Self {
        Self {
            settings,
            store,
            registry,
            tls,
        }
    }
}

#[derive(Clone)]
pub struct TlsContext {
    pub client: Arc<ClientConfig>,
}

impl TlsContext {
    pub fn new(client: Arc<ClientConfig>) -> Self {
        Self { client }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
