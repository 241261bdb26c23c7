//! Image reference and resource-limit parsing.

use std::fmt;

use crate::error::RuntimeError;

const DEFAULT_TAG: &str = "latest";

/// An image reference split into the parts a pull needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host, empty for the default index.
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Reference to hand to the runtime's pull.
    pub fn pull_reference(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Split `registry/repository:tag`. The first path component is a registry
/// only when it looks like a host (`.` or `:` in it, or `localhost`).
pub fn split_docker_image(reference: &str) -> ImageRef {
    let (registry, rest) = match reference.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest)
        }
        _ => (String::new(), reference),
    };

    // a ':' only separates a tag inside the last path component
    let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (repository, tag) = match rest[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (rest[..split].to_string(), rest[split + 1..].to_string())
        }
        None => (rest.to_string(), DEFAULT_TAG.to_string()),
    };

    ImageRef {
        registry,
        repository,
        tag,
    }
}

/// Parse a memory limit such as `512m`, `1g`, `64kb` or `1048576` into bytes.
pub fn parse_memory(value: &str) -> Result<i64, RuntimeError> {
    let invalid = || RuntimeError::InvalidMemory(value.to_string());
    let lower = value.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((i, 'k')) => (&trimmed[..i], 1i64 << 10),
        Some((i, 'm')) => (&trimmed[..i], 1 << 20),
        Some((i, 'g')) => (&trimmed[..i], 1 << 30),
        Some(_) => (trimmed, 1),
        None => return Err(invalid()),
    };

    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    amount.checked_mul(multiplier).ok_or_else(invalid)
}
