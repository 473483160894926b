//! Common types used throughout remotesync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Identifier for a configured sync target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    /// Create a new TargetId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "TargetId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An absolute, normalized path on the remote server.
///
/// Always uses '/' as separator regardless of the local platform. `.`
/// components are dropped; `..` is rejected so a mapped path can never
/// escape the remote root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    components: Vec<String>,
}

impl RemotePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if a component is empty, `..`, or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a remote path string. Both '/' and '\\' separate components.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let components = path
            .split(['/', '\\'])
            .filter(|c| !c.is_empty() && *c != ".")
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Map a local file under `local_root` to its location under `remote_root`.
    ///
    /// # Errors
    /// - `local` is not inside `local_root`
    /// - `local` contains `..` or a non UTF-8 component
    pub fn from_local(
        local_root: &Path,
        remote_root: &RemotePath,
        local: &Path,
    ) -> crate::Result<Self> {
        let relative = local.strip_prefix(local_root).map_err(|_| {
            crate::Error::InvalidInput(format!(
                "{} is outside the sync root {}",
                local.display(),
                local_root.display()
            ))
        })?;

        let mut mapped = remote_root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        crate::Error::InvalidInput(format!(
                            "Path is not valid UTF-8: {}",
                            local.display()
                        ))
                    })?;
                    mapped = mapped.join(part)?;
                }
                Component::CurDir => {}
                _ => {
                    return Err(crate::Error::InvalidInput(format!(
                        "Unsupported path component in {}",
                        local.display()
                    )));
                }
            }
        }
        Ok(mapped)
    }

    /// Map this remote path back to a local path under `local_root`.
    ///
    /// # Errors
    /// - This path is not inside `remote_root`
    pub fn to_local(&self, remote_root: &RemotePath, local_root: &Path) -> crate::Result<PathBuf> {
        let relative = self.strip_prefix(remote_root).ok_or_else(|| {
            crate::Error::InvalidInput(format!("{} is outside the remote root {}", self, remote_root))
        })?;
        let mut local = local_root.to_path_buf();
        local.extend(relative);
        Ok(local)
    }

    /// Components remaining after removing `base`, if this path is inside it.
    pub fn strip_prefix(&self, base: &RemotePath) -> Option<&[String]> {
        if self.components.starts_with(&base.components) {
            Some(&self.components[base.components.len()..])
        } else {
            None
        }
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Every ancestor from the first component down to this path itself.
    pub fn ancestors_inclusive(&self) -> Vec<RemotePath> {
        (1..=self.components.len())
            .map(|n| Self {
                components: self.components[..n].to_vec(),
            })
            .collect()
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp == ".." {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be '..'".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}
