//! Package file naming convention.
//!
//! A package named `mysite_20261019_ab12cd` produces
//! `mysite_20261019_ab12cd_archive.zip` (or `.daf`) and
//! `mysite_20261019_ab12cd_installer.php`. Retention relies on these
//! suffixes to tell the two apart and to pair them by shared prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Archive suffix for zip-format packages.
pub const ARCHIVE_ZIP_SUFFIX: &str = "_archive.zip";

/// Archive suffix for the native DupArchive format.
pub const ARCHIVE_DAF_SUFFIX: &str = "_archive.daf";

/// Installer suffix.
pub const INSTALLER_SUFFIX: &str = "_installer.php";

/// The two files a package consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFileType {
    /// The small bootstrap script used to drive a restore.
    Installer,
    /// The compressed site payload.
    Archive,
}

impl PackageFileType {
    /// Return the file type as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installer => "installer",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for PackageFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Archive file name for a package prefix.
pub fn archive_name(prefix: &str) -> String {
    format!("{prefix}{ARCHIVE_ZIP_SUFFIX}")
}

/// Installer file name for a package prefix.
pub fn installer_name(prefix: &str) -> String {
    format!("{prefix}{INSTALLER_SUFFIX}")
}

/// Classify a stored file name, returning its type and the shared package
/// prefix. Names that follow neither convention return `None` and are never
/// touched by retention.
pub fn classify(name: &str) -> Option<(PackageFileType, &str)> {
    if let Some(prefix) = name.strip_suffix(INSTALLER_SUFFIX) {
        return non_empty(prefix).map(|p| (PackageFileType::Installer, p));
    }
    name.strip_suffix(ARCHIVE_ZIP_SUFFIX)
        .or_else(|| name.strip_suffix(ARCHIVE_DAF_SUFFIX))
        .and_then(non_empty)
        .map(|p| (PackageFileType::Archive, p))
}

fn non_empty(prefix: &str) -> Option<&str> {
    if prefix.is_empty() { None } else { Some(prefix) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_suffix() {
        assert_eq!(
            classify("site_1_archive.zip"),
            Some((PackageFileType::Archive, "site_1"))
        );
        assert_eq!(
            classify("site_1_archive.daf"),
            Some((PackageFileType::Archive, "site_1"))
        );
        assert_eq!(
            classify("site_1_installer.php"),
            Some((PackageFileType::Installer, "site_1"))
        );
        assert_eq!(classify("_installer.php"), None);
        assert_eq!(classify("notes.txt"), None);
        assert_eq!(classify("site_1_archive.zip.part"), None);
    }

    #[test]
    fn names_round_trip_through_classify() {
        let archive = archive_name("blog_abc");
        let installer = installer_name("blog_abc");
        assert_eq!(classify(&archive).map(|c| c.1), Some("blog_abc"));
        assert_eq!(classify(&installer).map(|c| c.1), Some("blog_abc"));
    }
}
