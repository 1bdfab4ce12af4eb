use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Main,
    Init,
}

impl ContainerKind {
    /// Field name of the container array inside the pod spec
    pub fn field(&self) -> &'static str {
        match self {
            ContainerKind::Main => "containers",
            ContainerKind::Init => "initContainers",
        }
    }
}

/// Normalization outcome for one container, keyed by its position in the decoded array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRewrite {
    pub kind: ContainerKind,
    pub index: usize,
    pub original: String,
    pub normalized: String,
}

impl ImageRewrite {
    pub fn is_change(&self) -> bool {
        !self.original.is_empty() && self.original != self.normalized
    }

    fn path(&self) -> PointerBuf {
        let index = self.index.to_string();
        PointerBuf::from_tokens(["spec", self.kind.field(), index.as_str(), "image"])
    }
}

/// How the pull secret reference gets attached to the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullSecretPatch {
    /// Provisioning failed, attach nothing
    Omit,
    /// The pod has no `imagePullSecrets` list yet
    CreateList(String),
    /// Append to the existing `imagePullSecrets` list
    Append(String),
}

impl PullSecretPatch {
    pub fn for_secret(name: impl Into<String>, has_existing_list: bool) -> Self {
        if has_existing_list {
            PullSecretPatch::Append(name.into())
        } else {
            PullSecretPatch::CreateList(name.into())
        }
    }

    fn operation(&self) -> Option<PatchOperation> {
        match self {
            PullSecretPatch::Omit => None,
            PullSecretPatch::CreateList(name) => Some(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "imagePullSecrets"]),
                value: json!([{ "name": name }]),
            })),
            PullSecretPatch::Append(name) => Some(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "imagePullSecrets", "-"]),
                value: json!({ "name": name }),
            })),
        }
    }
}

/// Builds the pod patch: image replacements in the order given (main containers first,
/// then init containers), followed by at most one pull secret operation.
pub fn build_patch(rewrites: &[ImageRewrite], pull_secret: &PullSecretPatch) -> Patch {
    let mut operations: Vec<PatchOperation> = rewrites
        .iter()
        .filter(|rewrite| rewrite.is_change())
        .map(|rewrite| {
            PatchOperation::Replace(ReplaceOperation {
                path: rewrite.path(),
                value: json!(rewrite.normalized),
            })
        })
        .collect();

    operations.extend(pull_secret.operation());
    Patch(operations)
}
