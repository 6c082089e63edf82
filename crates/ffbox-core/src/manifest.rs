//! Per-directory manifest codec.
//!
//! A manifest is the JSON file `.ffbox_dir_meta.json` written into every
//! deployed directory. It maps child names to records so a mounted tree can
//! answer listings and stat calls without enumerating the object store.
//! Presence of `size` distinguishes a file record from a directory record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved manifest file name. Never accepted as a user file or directory.
pub const DIR_META_NAME: &str = ".ffbox_dir_meta.json";

/// One child entry in a directory manifest.
///
/// File: `{ size, mtime, ctime, url }`. Directory: `{ url }`.
/// `url` is a fully qualified locator: `s3://bucket/key` after a push, or an
/// absolute local path (leading `/`) after a deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<f64>,
    pub url: String,
}

impl ManifestEntry {
    pub fn file(size: u64, mtime: f64, ctime: f64, url: impl Into<String>) -> Self {
        ManifestEntry {
            size: Some(size),
            mtime: Some(mtime),
            ctime: Some(ctime),
            url: url.into(),
        }
    }

    pub fn dir(url: impl Into<String>) -> Self {
        ManifestEntry {
            size: None,
            mtime: None,
            ctime: None,
            url: url.into(),
        }
    }

    /// Absence of `size` signals a directory.
    pub fn is_dir(&self) -> bool {
        self.size.is_none()
    }

    /// True if the locator points at a local absolute path (deploy mode)
    /// rather than an object-store locator. No URL normalization is done.
    pub fn is_local_url(&self) -> bool {
        self.url.starts_with('/')
    }
}

/// A directory manifest: child name → entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirManifest {
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl DirManifest {
    pub fn new() -> Self {
        DirManifest::default()
    }

    /// Parse manifest bytes. Rejects manifests that list the reserved name
    /// as a child; a deployed tree must never contain it as a user entry.
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let manifest: DirManifest =
            serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("corrupt manifest: {e}"))?;
        if manifest.entries.contains_key(DIR_META_NAME) {
            anyhow::bail!("manifest lists reserved name {DIR_META_NAME}");
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        if self.entries.contains_key(DIR_META_NAME) {
            anyhow::bail!("manifest lists reserved name {DIR_META_NAME}");
        }
        serde_json::to_vec_pretty(self).map_err(|e| anyhow::anyhow!("serializing manifest: {e}"))
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut manifest = DirManifest::new();
        manifest.insert(
            "model.bin",
            ManifestEntry::file(1024, 1700000000.5, 1700000000.5, "s3://bkt/a/model.bin"),
        );
        manifest.insert("sub", ManifestEntry::dir("s3://bkt/a/sub"));

        let bytes = manifest.to_bytes().unwrap();
        let parsed = DirManifest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, manifest);

        let file = &parsed.entries["model.bin"];
        assert!(!file.is_dir());
        assert_eq!(file.size, Some(1024));
        assert!(parsed.entries["sub"].is_dir());
    }

    #[test]
    fn dir_record_has_no_size_fields() {
        let mut manifest = DirManifest::new();
        manifest.insert("sub", ManifestEntry::dir("/data/sub"));
        let text = String::from_utf8(manifest.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("size"));
        assert!(!text.contains("mtime"));
    }

    #[test]
    fn local_url_detection() {
        assert!(ManifestEntry::dir("/abs/path").is_local_url());
        assert!(!ManifestEntry::dir("s3://bkt/key").is_local_url());
    }

    #[test]
    fn reserved_name_rejected() {
        let mut manifest = DirManifest::new();
        manifest.insert(DIR_META_NAME, ManifestEntry::file(1, 0.0, 0.0, "s3://b/x"));
        assert!(manifest.to_bytes().is_err());

        let json = format!(r#"{{"{DIR_META_NAME}": {{"url": "s3://b/x"}}}}"#);
        assert!(DirManifest::from_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn corrupt_manifest_fails() {
        assert!(DirManifest::from_bytes(b"not json").is_err());
    }
}
