//! Lexical path handling for archive member names.

use std::path::{Component, Path, PathBuf};

use anyhow::Error;

use crate::error::ArchiveError;

/// Lexically normalize a path, resolving `.` and `..` without touching the file system.
pub fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // "/.." is "/"
                Some(Component::RootDir) | Some(Component::Prefix(_)) => (),
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        PathBuf::from(".")
    } else {
        out.iter().collect()
    }
}

/// Check that the cleaned `candidate` does not leave the cleaned `base`.
fn is_within(base: &Path, candidate: &Path) -> bool {
    let rest = if base == Path::new(".") {
        if candidate.has_root() {
            return false;
        }
        candidate
    } else {
        match candidate.strip_prefix(base) {
            Ok(rest) => rest,
            Err(_) => return false,
        }
    };
    !matches!(rest.components().next(), Some(Component::ParentDir))
}

/// Join an archive member name onto the extraction base.
///
/// Leading slashes are dropped from the name, the joined path must stay below `base`.
pub fn safe_join(base: &Path, name: &str) -> Result<PathBuf, Error> {
    let base = clean(base);
    let candidate = clean(&base.join(name.trim_start_matches('/')));
    if !is_within(&base, &candidate) {
        return Err(ArchiveError::PathTraversal(name.to_string()).into());
    }
    Ok(candidate)
}

/// Validate a symlink about to be created at `symlink_path` pointing to `linkname`.
///
/// Relative targets are resolved from the symlink's parent directory. Absolute targets are
/// taken literally, the link is followed as is once created. Either way the result must stay
/// below `base`.
pub fn safe_symlink_target(base: &Path, symlink_path: &Path, linkname: &str) -> Result<(), Error> {
    if linkname.is_empty() {
        return Err(ArchiveError::EmptySymlinkTarget(symlink_path.display().to_string()).into());
    }

    let (base, resolved) = if linkname.starts_with('/') {
        let base = if base.is_absolute() {
            clean(base)
        } else {
            clean(&std::env::current_dir()?.join(base))
        };
        (base, clean(Path::new(linkname)))
    } else {
        let base = clean(base);
        let resolved = clean(&symlink_path.parent().unwrap_or(&base).join(linkname));
        (base, resolved)
    };

    if !is_within(&base, &resolved) {
        return Err(ArchiveError::SymlinkEscape {
            path: symlink_path.display().to_string(),
            target: linkname.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Remove the first `count` components of a member name.
///
/// Returns `None` when the name has no more than `count` components, the entry is then
/// skipped entirely.
pub fn strip_components(name: &str, count: usize) -> Option<String> {
    if count == 0 {
        return Some(name.to_string());
    }
    let cleaned = clean(Path::new(name.trim_start_matches('/')));
    let parts: Vec<String> = cleaned
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect();
    if parts.len() <= count {
        return None;
    }
    Some(parts[count..].join("/"))
}

/// Turn a path into a relative archive member name.
///
/// Leading `/` and `../` components are removed, as an archive must not refer outside of
/// the extraction directory.
pub fn archive_name(path: &str) -> String {
    let cleaned = clean(Path::new(path));
    let parts: Vec<String> = cleaned
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
