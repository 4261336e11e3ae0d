use kube::Resource;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The string is not of the form `name` or `namespace/name`.
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
    /// The object has no `metadata.name`, so it has no stable identity.
    #[error("object has no name")]
    MissingName,
}

/// Stable identity of a watched object, used as work queue item.
///
/// The canonical string encoding is `namespace/name`, or just `name` for
/// cluster scoped objects (empty namespace). [`NamespacedName::from_str`]
/// inverts [`std::fmt::Display`] exactly, which is why both parts are only
/// accessible through a validating constructor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    namespace: String,
    name: String,
}

impl NamespacedName {
    /// Fails if `name` is empty or either part contains a `/`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, KeyError> {
        let (namespace, name) = (namespace.into(), name.into());
        if name.is_empty() || name.contains('/') || namespace.contains('/') {
            return Err(KeyError::Malformed(format!("{}/{}", namespace, name)));
        }
        Ok(Self { namespace, name })
    }

    /// Derive the key of a Kubernetes object.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        match meta.name.as_deref() {
            Some(name) if !name.is_empty() => {
                Self::new(meta.namespace.clone().unwrap_or_default(), name)
            }
            _ => Err(KeyError::MissingName),
        }
    }

    /// Empty for cluster scoped objects.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for NamespacedName {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.split('/').collect();
        let parsed = match parts.as_slice() {
            [name] => Self::new("", *name),
            [namespace, name] if !namespace.is_empty() => Self::new(*namespace, *name),
            _ => return Err(KeyError::Malformed(key.to_string())),
        };
        parsed.map_err(|_| KeyError::Malformed(key.to_string()))
    }
}
