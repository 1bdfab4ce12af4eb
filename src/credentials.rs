use crate::config::CredentialsConfig;
use crate::secret_store::{CreateOutcome, SecretStore, StoreError};
use crate::secret_string::SecretString;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

static SECRET_NAME_PREFIX: &str = "image.pulling.secret.";
static SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";
static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
static OWNER_LABEL: &str = "owner";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to look up secret {namespace}/{name}: {source}")]
    Lookup {
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("failed to create secret {namespace}/{name}: {source}")]
    Create {
        namespace: String,
        name: String,
        source: StoreError,
    },

    #[error("{operation} of secret {namespace}/{name} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        namespace: String,
        name: String,
        timeout: Duration,
    },

    #[error("failed to serialize docker config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How `ensure` found the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    AlreadyPresent,
    Created,
    /// A concurrent request created the secret between our lookup and create
    CreatedConcurrently,
}

/// Credentials for the mirror registry.
#[derive(Debug, Clone)]
pub struct PullCredential {
    pub registry_url: String,
    pub username: String,
    pub password: SecretString,
    pub email: String,
}

#[derive(Serialize)]
struct DockerAuth<'a> {
    username: &'a str,
    password: &'a str,
    email: &'a str,
    auth: String,
}

#[derive(Serialize)]
struct DockerAuths<'a> {
    auths: BTreeMap<&'a str, DockerAuth<'a>>,
}

impl PullCredential {
    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self {
            registry_url: config.registry_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            email: format!("{}@{}", config.username, config.email_domain),
        }
    }

    /// Base64 of `username:password`, the `auth` field of a docker config entry.
    pub fn basic_auth_token(&self) -> String {
        STANDARD.encode(format!(
            "{}:{}",
            self.username,
            self.password.expose_secret()
        ))
    }

    /// Serialized `{"auths": {<registry url>: {...}}}` document.
    pub fn docker_config_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let auths = DockerAuths {
            auths: BTreeMap::from([(
                self.registry_url.as_str(),
                DockerAuth {
                    username: &self.username,
                    password: self.password.expose_secret(),
                    email: &self.email,
                    auth: self.basic_auth_token(),
                },
            )]),
        };
        serde_json::to_vec(&auths)
    }

    pub fn secret_name(&self) -> String {
        format_name(&self.username)
    }
}

/// Maps a registry username to a secret name.
///
/// Lowercase letters and digits other than `x` are kept, every other byte becomes
/// `x-HH`. Because a literal `x` is escaped too the mapping can be reversed, so distinct
/// usernames never share a secret. `robot$ci` becomes `image.pulling.secret.robotx-24ci`.
pub fn format_name(username: &str) -> String {
    let mut name = String::with_capacity(SECRET_NAME_PREFIX.len() + username.len());
    name.push_str(SECRET_NAME_PREFIX);
    for byte in username.bytes() {
        if (byte.is_ascii_lowercase() && byte != b'x') || byte.is_ascii_digit() {
            name.push(byte as char);
        } else {
            // writing to a String cannot fail
            let _ = write!(name, "x-{:02x}", byte);
        }
    }
    name
}

/// Makes sure every namespace holds the mirror pull secret.
pub struct CredentialProvisioner<S> {
    store: S,
    credential: PullCredential,
    owner: String,
    timeout: Duration,
}

impl<S: SecretStore> CredentialProvisioner<S> {
    pub fn new(
        store: S,
        credential: PullCredential,
        owner: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            credential,
            owner: owner.into(),
            timeout,
        }
    }

    pub fn secret_name(&self) -> String {
        self.credential.secret_name()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub fn build_secret(&self, namespace: &str) -> Result<Secret, ProvisionError> {
        let payload = self.credential.docker_config_json()?;
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    OWNER_LABEL.to_string(),
                    self.owner.clone(),
                )])),
                ..ObjectMeta::default()
            },
            type_: Some(SECRET_TYPE_DOCKER_CONFIG_JSON.to_string()),
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_JSON_KEY.to_string(),
                ByteString(payload),
            )])),
            ..Secret::default()
        })
    }

    /// Creates the pull secret in `namespace` unless it is already there. Existing secrets
    /// are never updated. Losing a create race to another request counts as success.
    pub async fn ensure(&self, namespace: &str) -> Result<Provisioned, ProvisionError> {
        let name = self.secret_name();
        let deadline = Instant::now() + self.timeout;

        let existing = self
            .bounded(deadline, "lookup", namespace, &name, self.store.get(namespace, &name))
            .await?
            .map_err(|source| ProvisionError::Lookup {
                namespace: namespace.to_string(),
                name: name.clone(),
                source,
            })?;
        if existing.is_some() {
            debug!("Secret {}/{} already exists", namespace, name);
            return Ok(Provisioned::AlreadyPresent);
        }

        let secret = self.build_secret(namespace)?;
        let outcome = self
            .bounded(
                deadline,
                "creation",
                namespace,
                &name,
                self.store.create(namespace, &secret),
            )
            .await?
            .map_err(|source| ProvisionError::Create {
                namespace: namespace.to_string(),
                name: name.clone(),
                source,
            })?;

        match outcome {
            CreateOutcome::Created(created) => {
                info!(
                    "Secret {}/{} of type {} created",
                    namespace,
                    name,
                    created.type_.as_deref().unwrap_or(SECRET_TYPE_DOCKER_CONFIG_JSON)
                );
                Ok(Provisioned::Created)
            }
            CreateOutcome::AlreadyExists => {
                info!(
                    "Secret {}/{} was created by a concurrent request",
                    namespace, name
                );
                Ok(Provisioned::CreatedConcurrently)
            }
        }
    }

    /// Runs a store call against the deadline shared by the whole lookup and create sequence.
    async fn bounded<T>(
        &self,
        deadline: Instant,
        operation: &'static str,
        namespace: &str,
        name: &str,
        call: impl Future<Output = T>,
    ) -> Result<T, ProvisionError> {
        tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| ProvisionError::Timeout {
                operation,
                namespace: namespace.to_string(),
                name: name.to_string(),
                timeout: self.timeout,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory store that records every create call.
    #[derive(Default)]
    pub(crate) struct FakeSecretStore {
        pub(crate) secrets: Mutex<HashMap<(String, String), Secret>>,
        pub(crate) creates: AtomicUsize,
        pub(crate) fail_get: Option<u16>,
        pub(crate) fail_create: Option<u16>,
        /// Pretend another replica created the secret right after our lookup
        pub(crate) lose_race: bool,
        pub(crate) delay: Option<Duration>,
        pub(crate) create_delay: Option<Duration>,
    }

    #[async_trait]
    impl SecretStore for FakeSecretStore {
        async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(code) = self.fail_get {
                return Err(StoreError::Api {
                    code,
                    message: "lookup refused".to_string(),
                });
            }
            let secrets = self.secrets.lock().unwrap();
            Ok(secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create(
            &self,
            namespace: &str,
            secret: &Secret,
        ) -> Result<CreateOutcome, StoreError> {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(code) = self.fail_create {
                return Err(StoreError::Api {
                    code,
                    message: "create refused".to_string(),
                });
            }
            if self.lose_race {
                return Ok(CreateOutcome::AlreadyExists);
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            let name = secret.metadata.name.clone().unwrap_or_default();
            let mut secrets = self.secrets.lock().unwrap();
            secrets.insert((namespace.to_string(), name), secret.clone());
            Ok(CreateOutcome::Created(secret.clone()))
        }
    }

    pub(crate) fn credential() -> PullCredential {
        PullCredential {
            registry_url: "https://demo.goharbor.io/v2/".to_string(),
            username: "admin".to_string(),
            password: SecretString::from("Harbor12345"),
            email: "admin@goharbor.io".to_string(),
        }
    }

    fn provisioner(store: FakeSecretStore) -> CredentialProvisioner<FakeSecretStore> {
        CredentialProvisioner::new(store, credential(), "tars", Duration::from_secs(5))
    }

    #[test]
    fn test_basic_auth_token() {
        // base64("admin:Harbor12345")
        assert_eq!(credential().basic_auth_token(), "YWRtaW46SGFyYm9yMTIzNDU=");
    }

    #[test]
    fn test_docker_config_json_layout() {
        let json: serde_json::Value =
            serde_json::from_slice(&credential().docker_config_json().unwrap()).unwrap();
        let entry = &json["auths"]["https://demo.goharbor.io/v2/"];
        assert_eq!(entry["username"], "admin");
        assert_eq!(entry["password"], "Harbor12345");
        assert_eq!(entry["email"], "admin@goharbor.io");
        assert_eq!(entry["auth"], "YWRtaW46SGFyYm9yMTIzNDU=");
    }

    #[test]
    fn test_format_name_keeps_plain_usernames() {
        assert_eq!(format_name("admin"), "image.pulling.secret.admin");
        assert_eq!(format_name("ci01"), "image.pulling.secret.ci01");
    }

    #[test]
    fn test_format_name_substitutes_unsafe_characters() {
        assert_eq!(
            format_name("robot$ci+pull"),
            "image.pulling.secret.robotx-24cix-2bpull"
        );
        assert_eq!(format_name("Admin"), "image.pulling.secret.x-41dmin");
    }

    #[test]
    fn test_format_name_is_injective_for_lookalikes() {
        let names = ["robot$ci", "robotx-24ci", "robot-ci", "robot.ci", "ROBOT$CI", "x", "x-78"];
        let formatted: std::collections::HashSet<_> =
            names.iter().map(|name| format_name(name)).collect();
        assert_eq!(formatted.len(), names.len());
    }

    #[test]
    fn test_format_name_produces_valid_dns_label() {
        let label_pattern = regex::Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
        for username in ["admin", "robot$ci", "-lead", "trail.", "Ünicode", "a b"] {
            let name = format_name(username);
            let label = name.strip_prefix(SECRET_NAME_PREFIX).unwrap();
            assert!(label_pattern.is_match(label), "{} is not a valid label", label);
        }
    }

    #[test]
    fn test_build_secret_shape() {
        let secret = provisioner(FakeSecretStore::default())
            .build_secret("team-a")
            .unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("image.pulling.secret.admin"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("team-a"));
        assert_eq!(
            secret.metadata.labels.unwrap().get("owner").map(String::as_str),
            Some("tars")
        );
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        let data = secret.data.unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key(".dockerconfigjson"));
    }

    #[tokio::test]
    async fn test_ensure_twice_creates_one_secret() {
        let provisioner = provisioner(FakeSecretStore::default());

        assert_eq!(provisioner.ensure("team-a").await.unwrap(), Provisioned::Created);
        assert_eq!(
            provisioner.ensure("team-a").await.unwrap(),
            Provisioned::AlreadyPresent
        );
        assert_eq!(provisioner.store.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_is_per_namespace() {
        let provisioner = provisioner(FakeSecretStore::default());

        provisioner.ensure("team-a").await.unwrap();
        provisioner.ensure("team-b").await.unwrap();
        assert_eq!(provisioner.store.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_treats_lost_race_as_success() {
        let provisioner = provisioner(FakeSecretStore {
            lose_race: true,
            ..FakeSecretStore::default()
        });

        assert_eq!(
            provisioner.ensure("team-a").await.unwrap(),
            Provisioned::CreatedConcurrently
        );
    }

    #[tokio::test]
    async fn test_ensure_reports_lookup_failure() {
        let provisioner = provisioner(FakeSecretStore {
            fail_get: Some(403),
            ..FakeSecretStore::default()
        });

        let err = provisioner.ensure("team-a").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Lookup { .. }));
        assert_eq!(provisioner.store.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_reports_create_failure() {
        let provisioner = provisioner(FakeSecretStore {
            fail_create: Some(500),
            ..FakeSecretStore::default()
        });

        let err = provisioner.ensure("team-a").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Create { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_times_out_slow_store() {
        let store = FakeSecretStore {
            delay: Some(Duration::from_secs(30)),
            ..FakeSecretStore::default()
        };
        let provisioner =
            CredentialProvisioner::new(store, credential(), "tars", Duration::from_secs(2));

        let err = provisioner.ensure("team-a").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { operation: "lookup", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_bounds_lookup_and_create_together() {
        let store = FakeSecretStore {
            delay: Some(Duration::from_millis(4900)),
            create_delay: Some(Duration::from_millis(4900)),
            ..FakeSecretStore::default()
        };
        let provisioner =
            CredentialProvisioner::new(store, credential(), "tars", Duration::from_secs(5));
        let started = Instant::now();

        let err = provisioner.ensure("team-a").await.unwrap_err();

        assert!(matches!(err, ProvisionError::Timeout { operation: "creation", .. }));
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(provisioner.store.creates.load(Ordering::SeqCst), 0);
    }
}
