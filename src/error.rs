//! Classification of weaving errors.

use thiserror::Error;

/// A weaving error.
///
/// Every variant is fatal for the operation that produced it. Recoverable
/// outcomes, such as a pointcut that matches nothing, are not errors and are
/// reported through empty results instead.
#[derive(Error, Debug)]
pub enum WeaverError {
    /// The code text could not be parsed into blocks.
    #[error("parse error at byte {offset}: {msg}")]
    Parse {
        /// Byte offset into the (normalized) input.
        offset: usize,
        /// Description of the problem.
        msg: String,
    },
    /// The module violates a structural expectation, e.g. a `func` without
    /// children or an import with the wrong arity.
    #[error("malformed module: {0}")]
    Structural(String),
    /// A tree operation failed on a specific block.
    ///
    /// `block` is the compact textual form of the offending block so that the
    /// user can locate it in the source.
    #[error("{msg} (at `{block}`)")]
    Block {
        /// Compact serialization of the block.
        block: String,
        /// Description of the problem.
        msg: String,
    },
    /// A child index or child reference did not exist in its parent.
    #[error("index out of range (index {index}, length {len})")]
    OutOfRange {
        /// The requested index.
        index: usize,
        /// The number of children.
        len: usize,
    },
    /// A name lookup in the module context failed where it is mandatory.
    #[error("unknown {kind} `{name}`")]
    Unknown {
        /// The entity class (function, global, type, local, ...).
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },
    /// A runtime variable type could not be parsed.
    #[error("invalid variable type `{0}`")]
    InvalidType(String),
    /// A variable declaration could not be parsed.
    #[error("invalid variable declaration `{input}`: {msg}")]
    Variable {
        /// The declaration text.
        input: String,
        /// Description of the problem.
        msg: String,
    },
    /// A template or one of its variable operations is invalid.
    #[error("template `{template}`: {msg}")]
    Template {
        /// The template key.
        template: String,
        /// Description of the problem.
        msg: String,
    },
    /// A keyword expression failed to lex, parse or evaluate.
    #[error("keyword `{expr}`: {msg}")]
    Keyword {
        /// The expression text.
        expr: String,
        /// Description of the problem.
        msg: String,
    },
    /// A pointcut expression failed to parse or refers to something that
    /// does not exist.
    #[error("pointcut `{expr}`: {msg}")]
    Pointcut {
        /// The pointcut text.
        expr: String,
        /// Description of the problem.
        msg: String,
    },
    /// The pattern-match provider failed.
    #[error("pattern matcher failed: {0}")]
    Matcher(String),
    /// I/O failure while talking to an external pattern matcher.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Malformed JSON from an external pattern matcher.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WeaverError {
    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    pub(crate) fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Unknown {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            msg: msg.into(),
        }
    }

    pub(crate) fn pointcut(expr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Pointcut {
            expr: expr.into(),
            msg: msg.into(),
        }
    }

    pub(crate) fn keyword(expr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Keyword {
            expr: expr.into(),
            msg: msg.into(),
        }
    }
}

/// A convenient alias for a `Result` that uses `WeaverError` as the error type.
pub type WeaverResult<T> = Result<T, WeaverError>;
