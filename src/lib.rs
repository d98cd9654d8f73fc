pub mod cli;
pub mod io_util;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::proxy::{AppContext, TlsContext, registry::InFlightRegistry, store::ObjectStore};
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(Arc::new(settings))?;
    proxy::run(app).await
}

/// Assemble the shared per-process state. Split out of [`run`] so tests can
/// bind a proxy instance on an ephemeral port.
pub fn build_app(settings: Arc<Settings>) -> Result<AppContext> {
    let store = Arc::new(ObjectStore::new(settings.data_dir.clone()));
    let registry = InFlightRegistry::new();
    let tls = Arc::new(TlsContext::new(Arc::new(build_tls_client_config()?)));
    Ok(AppContext::new(settings, store, registry, tls))
}

fn build_tls_client_config() -> Result<ClientConfig> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            if added == 0 {
                warn!("no trust anchors loaded; https origin fetches will fail verification");
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
