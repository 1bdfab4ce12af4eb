use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::PostParams;
use kube::{Api, Client};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("API server returned {code}: {message}")]
    Api { code: u16, message: String },

    #[error("request to API server failed: {0}")]
    Transport(String),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => StoreError::Api {
                code: response.code,
                message: response.message.clone(),
            },
            other => StoreError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Secret),
    /// Someone else created a secret with the same name first
    AlreadyExists,
}

/// Namespaced secret storage used by the credential provisioner.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` when no secret with that name exists in the namespace.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<CreateOutcome, StoreError>;
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<CreateOutcome, StoreError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.create(&PostParams::default(), secret).await {
            Ok(created) => Ok(CreateOutcome::Created(created)),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }
}
