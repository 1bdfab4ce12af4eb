use crate::config::Config;
use crate::credentials::{CredentialProvisioner, PullCredential};
use crate::image_reference::Normalizer;
use crate::mutation::PodMutator;
use crate::secret_store::SecretStore;
use tracing::info;

/// Read-only state shared by all webhook requests.
pub struct WebhookState<S> {
    pub(crate) mutator: PodMutator<S>,
}

impl<S: SecretStore> WebhookState<S> {
    pub fn from_config(config: &Config, store: S) -> Self {
        let normalizer = Normalizer::new(&config.mirror.registry, &config.mirror.default_tag);
        info!(
            "Routing unqualified images through {}, pull secret {} owned by {}",
            normalizer.registry(),
            crate::credentials::format_name(&config.credentials.username),
            config.credentials.owner
        );
        let provisioner = CredentialProvisioner::new(
            store,
            PullCredential::from_config(&config.credentials),
            &config.credentials.owner,
            config.kubernetes.timeout(),
        );
        Self {
            mutator: PodMutator::new(normalizer, provisioner),
        }
    }
}
