use crate::secret_store::KubeSecretStore;
use crate::state::WebhookState;
use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

mod config;
mod credentials;
mod image_reference;
mod mutation;
mod patch;
mod secret_store;
mod secret_string;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-mirror {}", env!("CARGO_PKG_VERSION"));

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install the aws-lc-rs crypto provider");
    }

    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| "/config/config.yaml".to_string());
    let config = config::load_config(&config_path)?;

    let client = secret_store::create_client().await?;
    let state = Arc::new(WebhookState::from_config(
        &config,
        KubeSecretStore::new(client),
    ));

    let app = webserver::create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webserver.port));

    match &config.webserver.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load TLS certificate {} and key {}",
                        tls.cert_path.display(),
                        tls.key_path.display()
                    )
                })?;
            info!("Starting HTTPS webserver on {}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            warn!("No TLS configured, the API server only calls webhooks over HTTPS");
            info!("Starting webserver on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
