use std::fmt;

use anyhow::Result;

use crate::error::Error;

/// Fallback tag when a reference omits one.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed `[<registry>/]<path>:<tag>` reference.
///
/// The registry is optional; a store opened without one is purely local and
/// has no remote. Following conventional container-reference rules, the
/// first path segment is a registry when it contains a `.` or `:` or is
/// `localhost`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl StoreRef {
    /// # Errors
    ///
    /// Returns [`Error::InvalidRef`] for empty components or a missing path.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidRef(input.to_string());

        let (rest, tag) = match input.rsplit_once(':') {
            Some((rest, tag)) if !tag.contains('/') => (rest, tag),
            _ => (input, DEFAULT_TAG),
        };
        if rest.is_empty() || tag.is_empty() {
            return Err(invalid().into());
        }

        let (registry, repository) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, rest.to_string()),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid().into());
        }

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }

    /// Filename-safe form used for the persisted index:
    /// `/` and `:` become `_`.
    #[must_use]
    pub fn sanitized(&self) -> String {
        self.to_string().replace(['/', ':'], "_")
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
