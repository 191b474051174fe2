//! Node path composition and validation.
//!
//! Store paths are absolute, `/`-separated, with no empty components and no
//! trailing separator. The root is `/`.
//!
//! [`join_paths`] composes a path from segments the way callers usually have
//! them at hand: a configured namespace that may or may not carry slashes,
//! plus a child name.

/// A path that cannot be composed or is not a valid node path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path {input:?}: {reason}")]
pub struct PathError {
    pub input: String,
    pub reason: String,
}

impl PathError {
    fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Join path segments with exactly one `/` between them.
///
/// One leading and one trailing `/` is stripped from every segment. The
/// result starts with `/` only if the first segment did. A segment that is
/// empty, before or after trimming, is rejected; the single exception is a
/// first segment of exactly `/`, which stands for the store root.
///
/// ```
/// use noderepo_store::path::join_paths;
///
/// assert_eq!(join_paths(&["/apps/", "/cars"]).unwrap(), "/apps/cars");
/// assert_eq!(join_paths(&["apps", "7"]).unwrap(), "apps/7");
/// assert_eq!(join_paths(&["/", "cars"]).unwrap(), "/cars");
/// assert!(join_paths(&["/apps", ""]).is_err());
/// ```
pub fn join_paths(segments: &[&str]) -> Result<String, PathError> {
    let Some(first) = segments.first() else {
        return Err(PathError::new("[]", "no segments to join"));
    };
    let leading = first.starts_with('/');

    let mut parts = Vec::with_capacity(segments.len());
    for (i, raw) in segments.iter().enumerate() {
        if raw.is_empty() {
            return Err(PathError::new(
                format!("{segments:?}"),
                format!("segment {i} is empty"),
            ));
        }
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            if i == 0 && *raw == "/" {
                continue;
            }
            return Err(PathError::new(
                format!("{segments:?}"),
                format!("segment {i} is empty after trimming separators"),
            ));
        }
        parts.push(trimmed);
    }

    let joined = parts.join("/");
    Ok(if leading { format!("/{joined}") } else { joined })
}

/// Path of the child `name` directly under `parent`.
pub fn child_path(parent: &str, name: &str) -> Result<String, PathError> {
    join_paths(&[parent, name])
}

/// Check that `path` is a well-formed absolute node path.
pub fn validate_node_path(path: &str) -> Result<(), PathError> {
    if !path.starts_with('/') {
        return Err(PathError::new(path, "node paths must be absolute"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(PathError::new(path, "trailing separator"));
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(PathError::new(path, "empty path component"));
    }
    Ok(())
}

/// Split a validated, non-root node path into its parent path and its name.
///
/// Returns `None` for the root.
pub fn parent_and_name(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}
