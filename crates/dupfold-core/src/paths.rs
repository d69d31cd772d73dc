use crate::error::Error;
use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Normalize one path component to NFC, lowercasing when the scan runs
/// case-insensitively. The original spelling is kept for display by callers.
pub fn normalize_name(name: &str, case_insensitive: bool) -> String {
    let normalized: String = name.nfc().collect();
    if case_insensitive {
        normalized.to_lowercase()
    } else {
        normalized
    }
}

/// Resolve and validate the scan root. Symlinks in the root itself are
/// resolved so all later confinement checks compare canonical forms.
pub fn resolve_root(root: &Path) -> Result<PathBuf, Error> {
    let metadata = match std::fs::metadata(root) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::RootNotFound(root.to_path_buf()))
        }
        Err(e) => return Err(Error::Io(e)),
    };
    if !metadata.is_dir() {
        return Err(Error::RootNotDirectory(root.to_path_buf()));
    }
    Ok(std::fs::canonicalize(root)?)
}

/// Join a relative path onto the resolved root and prove the result stays
/// inside it. Rejects absolute inputs and any `..` component outright, then
/// canonicalizes to catch symlinked escapes.
pub fn confine(root: &Path, relative: &str) -> Result<PathBuf, Error> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(Error::RootEscape(candidate.to_path_buf()));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(Error::RootEscape(candidate.to_path_buf())),
        }
    }
    let joined = root.join(candidate);
    let resolved = std::fs::canonicalize(&joined)?;
    if resolved == root || resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(Error::RootEscape(joined))
    }
}

/// `/`-separated path of `abs` relative to `root`; `"."` for the root itself.
pub fn relative(root: &Path, abs: &Path) -> Option<String> {
    let stripped = abs.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        Some(".".to_string())
    } else {
        Some(parts.join("/"))
    }
}

/// Append a child name to a relative path, treating `"."` as the root.
pub fn join_relative(parent: &str, child: &str) -> String {
    if parent == "." {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

/// Number of components; 0 for the root (`"."`).
pub fn depth(relative: &str) -> usize {
    if relative == "." {
        0
    } else {
        relative.split('/').count()
    }
}

/// Parent of a relative path, or `None` for the root itself.
pub fn parent(relative: &str) -> Option<String> {
    if relative == "." {
        return None;
    }
    match relative.rsplit_once('/') {
        Some((parent, _)) => Some(parent.to_string()),
        None => Some(".".to_string()),
    }
}

/// True when `child` lies strictly below `ancestor` (never equal).
pub fn is_strict_descendant(child: &str, ancestor: &str) -> bool {
    if child == ancestor {
        return false;
    }
    if ancestor == "." {
        return true;
    }
    child.starts_with(ancestor) && child.as_bytes().get(ancestor.len()) == Some(&b'/')
}
