use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Hostname-like first path segment: dot separated letter/digit labels, optional port,
/// terminated by `/`. At least one dot is required.
static REGISTRY_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9](?:[a-zA-Z0-9_-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9_-]*[a-zA-Z0-9])?)+(?::[0-9]+)?/",
    )
    .expect("registry domain pattern is valid")
});

/// Returns true when the reference starts with a registry host followed by `/`.
///
/// Single-label hosts are not recognised: `localhost:5000/img` and Docker Hub
/// namespaces like `library/busybox` are both classified as unqualified.
pub fn has_registry_domain(reference: &str) -> bool {
    REGISTRY_DOMAIN.is_match(reference)
}

/// An image reference split into its parts. Rendering with `Display` yields the exact
/// string it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: Option<String>,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(domain) = &self.domain {
            write!(f, "{}/", domain)?;
        }
        write!(f, "{}", self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    /// Splits a reference. Never fails: anything that is not a recognisable domain, tag
    /// or digest stays in `path`.
    pub fn parse(s: &str) -> Self {
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (s, None),
        };

        let (domain, remainder) = match name.split_once('/') {
            Some((domain, remainder)) if has_registry_domain(name) => {
                (Some(domain.to_string()), remainder)
            }
            _ => (None, name),
        };

        // A tag is a colon after the last slash
        let tag_separator = remainder.rfind(':').filter(|colon| match remainder.rfind('/') {
            Some(slash) => *colon > slash,
            None => true,
        });
        let (path, tag) = match tag_separator {
            Some(colon) => (&remainder[..colon], Some(remainder[colon + 1..].to_string())),
            None => (remainder, None),
        };

        Self {
            domain,
            path: path.to_string(),
            tag,
            digest,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.tag.is_some() || self.digest.is_some()
    }
}

/// Rewrites image references so they are pulled through the mirror registry.
#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: String,
    default_tag: String,
}

impl Normalizer {
    pub fn new(registry: impl Into<String>, default_tag: impl Into<String>) -> Self {
        let registry = registry.into();
        Self {
            registry: registry.trim_end_matches('/').to_string(),
            default_tag: default_tag.into(),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Prefixes unqualified references with the mirror registry and appends the default
    /// tag when neither a tag nor a digest is present. Idempotent as long as the mirror
    /// registry itself passes [`has_registry_domain`].
    pub fn normalize(&self, image: &str) -> String {
        let qualified = if has_registry_domain(image) {
            image.to_string()
        } else {
            format!("{}/{}", self.registry, image)
        };

        let mut reference = ImageReference::parse(&qualified);
        if !reference.is_pinned() {
            reference.tag = Some(self.default_tag.clone());
        }
        reference.to_string()
    }
}
