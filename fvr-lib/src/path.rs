use crate::{FvrError, FvrResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized absolute path inside the forever namespace.
///
/// Always starts with `/`, never ends with `/` (except the root itself), and
/// contains no empty, `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FvrPath(String);

impl FvrPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// `/a//b/./c/../` -> `/a/b`. `..` above the root stays at the root.
    pub fn normalize(path: &str) -> FvrResult<Self> {
        if !path.starts_with('/') {
            return Err(FvrError::InvalidParam(format!(
                "path must be absolute: {}",
                path
            )));
        }

        let mut out: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    out.pop();
                }
                _ => out.push(segment),
            }
        }

        if out.is_empty() {
            Ok(Self::root())
        } else {
            Ok(Self(format!("/{}", out.join("/"))))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Base name; empty only for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(pos) => &self.0[pos + 1..],
            None => "",
        }
    }

    pub fn parent(&self) -> Option<FvrPath> {
        self.split_parent_name().map(|(parent, _)| parent)
    }

    /// Split into parent and name. Returns `None` for the root.
    pub fn split_parent_name(&self) -> Option<(FvrPath, String)> {
        if self.is_root() {
            return None;
        }
        let last_slash = self.0.rfind('/')?;
        let parent = if last_slash == 0 {
            "/".to_string()
        } else {
            self.0[..last_slash].to_string()
        };
        Some((FvrPath(parent), self.0[last_slash + 1..].to_string()))
    }

    pub fn join(&self, name: &str) -> FvrResult<FvrPath> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(FvrError::InvalidParam(format!("invalid name: {}", name)));
        }
        if self.is_root() {
            Ok(FvrPath(format!("/{}", name)))
        } else {
            Ok(FvrPath(format!("{}/{}", self.0, name)))
        }
    }
}

impl fmt::Display for FvrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for FvrPath {
    type Error = FvrError;

    fn try_from(value: &str) -> FvrResult<Self> {
        FvrPath::normalize(value)
    }
}
