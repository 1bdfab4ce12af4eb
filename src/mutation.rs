use crate::credentials::CredentialProvisioner;
use crate::image_reference::Normalizer;
use crate::patch::{ContainerKind, ImageRewrite, PullSecretPatch, build_patch};
use crate::secret_store::SecretStore;
use json_patch::Patch;
use k8s_openapi::api::core::v1::{Container, Pod};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("admission request carries no object")]
    MissingObject,

    #[error("could not deserialize pod object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("pod object has no spec")]
    MissingSpec,
}

/// Group, version and resource the admission request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceKind {
    pub fn pods() -> Self {
        Self {
            group: String::new(),
            version: "v1".to_string(),
            resource: "pods".to_string(),
        }
    }
}

/// The parts of an admission request the mutator reads.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub namespace: String,
    pub resource: ResourceKind,
    pub object: Option<serde_json::Value>,
    /// Server-side dry run, nothing may be written to the cluster
    pub dry_run: bool,
}

pub struct PodMutator<S> {
    normalizer: Normalizer,
    provisioner: CredentialProvisioner<S>,
}

impl<S: SecretStore> PodMutator<S> {
    pub fn new(normalizer: Normalizer, provisioner: CredentialProvisioner<S>) -> Self {
        Self {
            normalizer,
            provisioner,
        }
    }

    /// Computes the patch for a pod admission request.
    ///
    /// Returns `Ok(None)` for requests about anything other than pods. An undecodable
    /// object is the only error. Pull secret provisioning failures are logged and only
    /// drop the `imagePullSecrets` operation from the patch. Dry runs skip provisioning
    /// and reference the secret as a real request would.
    pub async fn mutate(
        &self,
        request: &AdmissionContext,
    ) -> Result<Option<Patch>, MutationError> {
        let pods = ResourceKind::pods();
        if request.resource != pods {
            warn!(
                resource = ?request.resource,
                "Expected resource to be {:?}, passing request through",
                pods
            );
            return Ok(None);
        }

        let object = request.object.clone().ok_or(MutationError::MissingObject)?;
        debug!(namespace = %request.namespace, "Pod coming: {}", object);
        let pod: Pod = serde_json::from_value(object)?;
        let spec = pod.spec.ok_or(MutationError::MissingSpec)?;

        let mut rewrites = self.rewrite_images(ContainerKind::Main, &spec.containers);
        if let Some(init_containers) = &spec.init_containers {
            rewrites.extend(self.rewrite_images(ContainerKind::Init, init_containers));
        }

        let provisioned = if request.dry_run {
            debug!(namespace = %request.namespace, "Dry run, not provisioning image pull secret");
            Ok(())
        } else {
            self.provisioner.ensure(&request.namespace).await.map(|_| ())
        };

        let pull_secret = match provisioned {
            Ok(()) => {
                info!(namespace = %request.namespace, "Appending image pull secret");
                PullSecretPatch::for_secret(
                    self.provisioner.secret_name(),
                    spec.image_pull_secrets.is_some(),
                )
            }
            Err(e) => {
                warn!(
                    namespace = %request.namespace,
                    error = %e,
                    "Could not provision image pull secret, admitting pod without it"
                );
                PullSecretPatch::Omit
            }
        };

        Ok(Some(build_patch(&rewrites, &pull_secret)))
    }

    fn rewrite_images(&self, kind: ContainerKind, containers: &[Container]) -> Vec<ImageRewrite> {
        containers
            .iter()
            .enumerate()
            .filter_map(|(index, container)| {
                let image = container.image.as_deref()?;
                if image.trim().is_empty() {
                    return None;
                }
                let normalized = self.normalizer.normalize(image);
                info!(
                    "Mutate image of {}[{}]: {} -> {}",
                    kind.field(),
                    index,
                    image,
                    normalized
                );
                Some(ImageRewrite {
                    kind,
                    index,
                    original: image.to_string(),
                    normalized,
                })
            })
            .collect()
    }
}
