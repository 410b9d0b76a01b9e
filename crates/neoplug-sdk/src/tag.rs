//! Device tags.
//!
//! A tag is a `(namespace, annotation, label)` triple used to select subsets
//! of devices. The string form is `namespace/annotation:label`; namespace and
//! annotation are optional in the string form. Tags written without an
//! explicit namespace land in the `default` namespace. The `system` namespace
//! is reserved for SDK-generated tags (`id:<uuid>`, `type:<type>`) and cannot
//! be authored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SdkError, SdkResult};

/// Namespace of SDK-generated tags.
pub const SYSTEM_NAMESPACE: &str = "system";

/// Namespace of user-authored tags without an explicit namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Annotation of the auto-generated id tag.
pub const ID_ANNOTATION: &str = "id";

/// Annotation of the auto-generated type tag.
pub const TYPE_ANNOTATION: &str = "type";

/// A device tag. Equality is componentwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    pub label: String,
}

impl Tag {
    /// Create a tag in the given namespace with no annotation.
    pub fn new(namespace: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            annotation: None,
            label: label.into(),
        }
    }

    /// Set the annotation component.
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// Parse a user-authored tag from its string form.
    ///
    /// Accepted forms: `label`, `annotation:label`, `namespace/label`,
    /// `namespace/annotation:label`. The `system` namespace is rejected.
    pub fn parse(s: &str) -> SdkResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SdkError::InvalidArgument("tag cannot be empty".into()));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(SdkError::InvalidArgument(format!(
                "tag '{}' cannot contain whitespace",
                s
            )));
        }

        let (namespace, rest) = match s.split_once('/') {
            Some((ns, rest)) => (ns, rest),
            None => (DEFAULT_NAMESPACE, s),
        };
        let (annotation, label) = match rest.split_once(':') {
            Some((ann, label)) => (Some(ann), label),
            None => (None, rest),
        };

        if namespace.is_empty() {
            return Err(SdkError::InvalidArgument(format!(
                "tag '{}' has an empty namespace",
                s
            )));
        }
        if namespace == SYSTEM_NAMESPACE {
            return Err(SdkError::InvalidArgument(format!(
                "tag '{}' uses the reserved '{}' namespace",
                s, SYSTEM_NAMESPACE
            )));
        }
        if matches!(annotation, Some("")) {
            return Err(SdkError::InvalidArgument(format!(
                "tag '{}' has an empty annotation",
                s
            )));
        }
        if label.is_empty() {
            return Err(SdkError::InvalidArgument(format!(
                "tag '{}' has an empty label",
                s
            )));
        }

        Ok(Self {
            namespace: namespace.to_string(),
            annotation: annotation.map(str::to_string),
            label: label.to_string(),
        })
    }

    /// The auto-generated `system/id:<uuid>` tag.
    pub fn device_id(id: &Uuid) -> Self {
        Self::new(SYSTEM_NAMESPACE, id.to_string()).with_annotation(ID_ANNOTATION)
    }

    /// The auto-generated `system/type:<type>` tag.
    pub fn device_type(device_type: &str) -> Self {
        Self::new(SYSTEM_NAMESPACE, device_type).with_annotation(TYPE_ANNOTATION)
    }

    /// Whether this tag lives in the `system` namespace.
    pub fn is_system(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.annotation {
            Some(annotation) => write!(f, "{}/{}:{}", self.namespace, annotation, self.label),
            None => write!(f, "{}/{}", self.namespace, self.label),
        }
    }
}

impl std::str::FromStr for Tag {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
