//! Path containment and secret masking helpers.
//!
//! Path checks are purely lexical: `.` and `..` components are resolved
//! without touching the filesystem, so a path that does not exist yet can
//! still be validated before a handler creates it.

use std::path::{Component, Path, PathBuf};

use crate::error::{BridgeError, BridgeResult};

/// Number of trailing characters shown by [`mask_secret`].
pub const SECRET_VISIBLE_CHARS: usize = 4;

const SECRET_MASK: &str = "****";

/// Returns true if `path` resolves to a location inside `root`.
///
/// Relative paths are resolved against `root`. Empty or absent paths are
/// never considered inside.
pub fn is_path_within_project(path: Option<&str>, root: &Path) -> bool {
    match path {
        Some(p) if !p.trim().is_empty() => resolve_within(p, root).is_some(),
        _ => false,
    }
}

/// Validates a path argument and returns its normalized absolute form.
///
/// # Errors
///
/// - `BridgeError::Validation` if the path is empty
/// - `BridgeError::PathTraversal` if it resolves outside `root`
pub fn validate_and_normalize_path(path: &str, root: &Path) -> BridgeResult<PathBuf> {
    if path.trim().is_empty() {
        return Err(BridgeError::invalid_field("path", "must not be empty"));
    }

    resolve_within(path, root).ok_or_else(|| BridgeError::PathTraversal {
        path: path.to_string(),
    })
}

fn resolve_within(path: &str, root: &Path) -> Option<PathBuf> {
    let root = absolute_root(root)?;
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let normalized = normalize(&joined)?;
    if normalized.starts_with(&root) {
        Some(normalized)
    } else {
        None
    }
}

fn absolute_root(root: &Path) -> Option<PathBuf> {
    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(root)
    };
    normalize(&root)
}

/// Lexically resolves `.` and `..`. Returns `None` when `..` climbs above the
/// filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Masks a secret for display.
///
/// - absent or empty: `"not set"`
/// - at most four characters: `"set"`
/// - otherwise `"****"` followed by the last four characters
pub fn mask_secret(secret: Option<&str>) -> String {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return "not set".to_string(),
    };

    let count = secret.chars().count();
    if count <= SECRET_VISIBLE_CHARS {
        return "set".to_string();
    }

    let tail: String = secret.chars().skip(count - SECRET_VISIBLE_CHARS).collect();
    format!("{SECRET_MASK}{tail}")
}

/// Replaces every occurrence of each non-empty secret in `text` with its masked form.
pub fn redact_secrets(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| {
            acc.replace(secret, &mask_secret(Some(secret)))
        })
}

/// Constant-time token comparison.
pub fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
