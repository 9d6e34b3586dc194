use crate::error::{PkgError, Result};
use bap_core::PkgInfo;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Reserved archive entry holding the serialized metadata.
pub const MANIFEST_NAME: &str = "PKGINFO";

/// Default name of the package definition inside a source directory.
pub const DEFINITION_FILE: &str = "pkginfo";

pub const ARCHIVE_EXTENSION: &str = ".bap";

/// A package row from a cached repository index.
#[derive(Debug, Clone, Serialize)]
pub struct AvailablePackage {
    pub repository: String,
    pub info: PkgInfo,
}

/// Outcome of a successful uninstall.
///
/// `missing` lists owned paths that were already gone from disk and
/// `unremovable` those that could not be deleted. Both are reported, never
/// fatal.
#[derive(Debug, Clone, Default)]
pub struct UninstallReport {
    pub package: String,
    pub removed: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub unremovable: Vec<PathBuf>,
}

/// Accept `name` only if it is a single plain path component, so it can be
/// used as a cache file name and an URL segment.
pub fn validate_package_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    );
    if single && !name.contains(['/', '\\']) {
        Ok(name)
    } else {
        Err(PkgError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_package_name() {
        for ok in ["rocket", "quick_turret", "skins-2", "a.b"] {
            assert!(validate_package_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", ".", "..", "../evil", "a/b", "a/", "/abs", "./x", "a\\b"] {
            assert!(
                matches!(validate_package_name(bad), Err(PkgError::InvalidName(_))),
                "{}",
                bad
            );
        }
    }
}
