use crate::error::{QfsError, Result};

/// A repository locator: `s3://bucket/prefix`, with the prefix optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocator {
    pub bucket: String,
    pub prefix: String,
}

impl RepoLocator {
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("s3://").ok_or_else(|| {
            QfsError::Config(format!(
                "not a repository locator (expected s3://bucket/prefix): {}",
                s
            ))
        })?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(QfsError::Config(format!("missing bucket name: {}", s)));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }
}

impl std::fmt::Display for RepoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.prefix)
        }
    }
}
