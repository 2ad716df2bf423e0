//! Error types for stage configuration.
//!
//! Stages never fail a batch. A configuration error only switches the
//! affected stage into pass-through mode.

/// Invalid stage configuration detected at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A numeric setting is outside its valid range.
    #[error("{stage}: `{field}` out of range: {reason}")]
    OutOfRange {
        /// Stage that owns the setting.
        stage: &'static str,
        /// Setting name.
        field: &'static str,
        /// What the valid range is.
        reason: String,
    },
    /// A pattern failed to compile.
    #[error("{stage}: invalid pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// Stage that owns the pattern.
        stage: &'static str,
        /// Offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },
}

impl ConfigError {
    /// Builds an [`ConfigError::OutOfRange`].
    pub fn out_of_range(stage: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            stage,
            field,
            reason: reason.into(),
        }
    }

    /// Name of the stage the error belongs to.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::OutOfRange { stage, .. } | Self::InvalidPattern { stage, .. } => stage,
        }
    }
}
