// Docker image references: [registry/]repository[:tag][@digest]

use crate::errors::{Result, RigError};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const DEFAULT_TAG: &str = "latest";

fn repository_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let component = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
        Regex::new(&format!("^{c}(?:/{c})*$", c = component)).expect("repository pattern is valid")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag pattern is valid"))
}

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageName {
    /// Parse an image reference such as `confluentinc/cp-kafka:7.4.0`
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid =
            |reason: &str| RigError::InvalidImageName(reference.to_string(), reason.to_string());

        let reference_trimmed = reference.trim();
        if reference_trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (rest, digest) = match reference_trimmed.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("digest must look like 'algorithm:hex'"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference_trimmed, None),
        };

        // A registry is the first path component when it looks like a host
        let (registry, remainder) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder)
            }
            _ => (None, rest),
        };

        // The tag separator is the last ':' after the last '/'
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(remainder[split + 1..].to_string()))
            }
            None => (remainder, None),
        };

        if !repository_pattern().is_match(repository) {
            return Err(invalid(
                "repository must be lowercase alphanumerics separated by '.', '_', '-' or '/'",
            ));
        }
        if let Some(tag) = &tag {
            if !tag_pattern().is_match(tag) {
                return Err(invalid("malformed tag"));
            }
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Copy of this image with a different tag (any digest is dropped)
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !tag_pattern().is_match(tag) {
            return Err(RigError::InvalidImageName(
                format!("{}:{}", self.unversioned(), tag),
                "malformed tag".to_string(),
            ));
        }
        Ok(Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        })
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Registry and repository without tag or digest
    pub fn unversioned(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.unversioned();
        match (&self.tag, &self.digest) {
            (Some(tag), Some(digest)) => write!(f, "{}:{}@{}", name, tag, digest),
            (Some(tag), None) => write!(f, "{}:{}", name, tag),
            (None, Some(digest)) => write!(f, "{}@{}", name, digest),
            (None, None) => write!(f, "{}:{}", name, DEFAULT_TAG),
        }
    }
}

impl FromStr for ImageName {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
