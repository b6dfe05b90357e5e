//! Error types shared across the engine.
//!
//! Everything fallible returns [`Result`]. Errors carry a coarse
//! [`ErrorKind`] so callers can distinguish user-level failures (bad cast,
//! missing column) from engine-level ones (transaction conflict) without
//! string matching.

use std::fmt;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Conversion or comparison between incompatible types, or a literal
    /// that fails to parse under its target type.
    Cast,
    /// Relation, column, or catalog object not found. Raised during
    /// selection-graph construction, before any row is touched.
    NotFound,
    /// Commit attempted after the parent snapshot diverged.
    TransactionConflict,
    /// Unique/not-null constraint violation.
    Constraint,
    /// Recognized but intentionally unimplemented operation.
    Unsupported,
    /// Write attempted against a read-only relation or schema.
    Permission,
    /// Engine bug or broken invariant.
    Internal,
}

impl ErrorKind {
    const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Cast => "cast",
            ErrorKind::NotFound => "not found",
            ErrorKind::TransactionConflict => "transaction conflict",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Permission => "permission",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub struct DbError {
    kind: ErrorKind,
    message: String,
    /// Extra key/value context attached via `with_field`.
    fields: Vec<(&'static str, String)>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Internal, message)
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        DbError {
            kind,
            message: message.into(),
            fields: Vec::new(),
            source: None,
        }
    }

    pub fn with_field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        for (key, value) in &self.fields {
            write!(f, "\n  {key} = {value}")?;
        }
        if let Some(source) = &self.source {
            write!(f, "\n  caused by: {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Attach context to an error while propagating it.
pub trait ResultExt<T> {
    fn context(self, msg: &'static str) -> Result<T>;
    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| DbError::new(msg).with_source(e))
    }

    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| DbError::new(f()).with_source(e))
    }
}

/// Return early with an unsupported-feature error naming the missing
/// feature.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {
        return Err($crate::DbError::with_kind(
            $crate::ErrorKind::Unsupported,
            format!($($arg)*),
        ))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_fields() {
        let err = DbError::with_kind(ErrorKind::Cast, "cannot cast")
            .with_field("from", "text")
            .with_field("to", "integer");
        let s = err.to_string();
        assert!(s.contains("cast: cannot cast"));
        assert!(s.contains("from = text"));
        assert!(s.contains("to = integer"));
    }

    #[test]
    fn kind_preserved() {
        let err = DbError::with_kind(ErrorKind::TransactionConflict, "diverged");
        assert_eq!(ErrorKind::TransactionConflict, err.kind());
    }

    #[test]
    fn not_implemented_returns_unsupported() {
        fn check() -> Result<()> {
            not_implemented!("merge join");
        }
        let err = check().unwrap_err();
        assert_eq!(ErrorKind::Unsupported, err.kind());
        assert!(err.message().contains("merge join"));
    }
}
