//! Error types for the cinder engine.
//!
//! A single error enum covers every subsystem, from config parsing to the
//! write path, with helper constructors so call sites stay terse.

use std::sync::Arc;

use strsim::jaro_winkler;
use thiserror::Error;

/// The primary error type for cinder operations.
#[derive(Error, Debug)]
pub enum CinderError {
    /// Invalid or missing configuration fields
    #[error("Config error: {message}")]
    Config { message: String },

    /// Type mismatch during schema validation
    #[error("Type error: {message}")]
    Type { message: String },

    /// Schema error (column not found, shape mismatch, etc.)
    #[error("Schema error: {message}")]
    Schema { message: String },

    /// Catalog error (database or table not found, etc.)
    #[error("Catalog error: {message}")]
    Catalog { message: String },

    /// An object with this name already exists in a conflicting namespace
    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    /// Transient construction failure of a loadable object
    #[error("Construction failed: {message}")]
    Construction { message: String },

    /// A fan-out sub-sink failed mid-write
    #[error("Forward error: {message}")]
    Forward { message: String },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Arrow error
    #[error("Arrow error: {message}")]
    Arrow { message: String },

    /// Internal error (bug in the engine)
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Not implemented
    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    /// Invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl CinderError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a catalog error.
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Create an already-exists error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create a construction error.
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }

    /// Create a forward error.
    pub fn forward(message: impl Into<String>) -> Self {
        Self::Forward {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a not implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a catalog error with suggestions for similar table names.
    pub fn catalog_with_suggestions(not_found: &str, available: &[String]) -> Self {
        let suggestions = find_similar_names(not_found, available, 3);
        let mut message = format!("Table '{}' not found", not_found);

        if !suggestions.is_empty() {
            message.push_str(". Did you mean: ");
            message.push_str(&suggestions.join(", "));
            message.push('?');
        }

        Self::Catalog { message }
    }

    /// Re-surface an error captured in a registry entry.
    ///
    /// The registry stores captured errors behind `Arc`; this produces a
    /// fresh owned error carrying the original message.
    pub fn from_stored(stored: &Arc<CinderError>) -> Self {
        Self::Construction {
            message: stored.to_string(),
        }
    }
}

/// Find similar names using Jaro-Winkler distance.
///
/// Returns up to `max_suggestions` names that are similar to `target`,
/// sorted by similarity (most similar first).
pub fn find_similar_names(
    target: &str,
    candidates: &[String],
    max_suggestions: usize,
) -> Vec<String> {
    const MIN_SIMILARITY: f64 = 0.7;

    let target_lower = target.to_lowercase();

    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|c| (jaro_winkler(&target_lower, &c.to_lowercase()), c))
        .filter(|(score, _)| *score >= MIN_SIMILARITY)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    scored
        .into_iter()
        .take(max_suggestions)
        .map(|(_, name)| name.clone())
        .collect()
}

impl From<arrow::error::ArrowError> for CinderError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow {
            message: err.to_string(),
        }
    }
}

/// Result type alias for cinder operations.
pub type Result<T> = std::result::Result<T, CinderError>;
