//! Mount source: where the remote tree lives.

use std::path::{Path, PathBuf};

use ffbox_core::{FfboxError, FfboxResult};

/// A parsed mount source. `s3://bucket/prefix` selects the S3 backend; an
/// absolute local path selects the filesystem backend (a tree produced by
/// `ffbox deploy`). Anything else is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    S3 { bucket: String, prefix: String },
    Local { root: PathBuf },
}

impl Source {
    pub fn parse(input: &str) -> FfboxResult<Source> {
        if let Some(rest) = input.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(FfboxError::InvalidArgument(format!(
                    "s3 source has no bucket: {input}"
                )));
            }
            return Ok(Source::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }
        if input.starts_with('/') {
            return Ok(Source::Local {
                root: PathBuf::from(input),
            });
        }
        Err(FfboxError::InvalidArgument(format!(
            "source must be s3://bucket[/prefix] or an absolute path, got: {input}"
        )))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Source::Local { .. })
    }

    /// Object key for a mount-relative path: the prefix joined for S3, the
    /// bare relative path for a local tree. `rel = ""` names the root.
    pub fn key(&self, rel: &str) -> String {
        let rel = rel.trim_matches('/');
        match self {
            Source::S3 { prefix, .. } => {
                if prefix.is_empty() {
                    rel.to_string()
                } else if rel.is_empty() {
                    prefix.clone()
                } else {
                    format!("{prefix}/{rel}")
                }
            }
            Source::Local { .. } => rel.to_string(),
        }
    }

    /// Fully qualified locator for a mount-relative path, as written into
    /// manifest `url` fields.
    pub fn url_for(&self, rel: &str) -> String {
        match self {
            Source::S3 { bucket, .. } => format!("s3://{bucket}/{}", self.key(rel)),
            Source::Local { root } => root.join(rel.trim_matches('/')).display().to_string(),
        }
    }

    /// Cache subdirectory for this source under the ffbox cache base:
    /// `<bucket>/<prefix>` for S3, the mountpoint-relative path for local
    /// trees (two mounts of the same deploy get separate caches).
    pub fn cache_subdir(&self, mountpoint: &Path) -> PathBuf {
        match self {
            Source::S3 { bucket, prefix } => {
                let mut dir = PathBuf::from(bucket);
                if !prefix.is_empty() {
                    dir.push(prefix);
                }
                dir
            }
            Source::Local { .. } => mountpoint
                .strip_prefix(Path::new("/"))
                .unwrap_or(mountpoint)
                .to_path_buf(),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::S3 { bucket, prefix } if prefix.is_empty() => write!(f, "s3://{bucket}"),
            Source::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
            Source::Local { root } => write!(f, "{}", root.display()),
        }
    }
}
