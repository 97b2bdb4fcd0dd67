use std::fmt;

use serde::{Deserialize, Serialize};

/// Callback phase, used to label hook failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    PreInstall,
    PostInstall,
    PreCreate,
    PostCreate,
    PreUpdate,
    PostUpdate,
    PreDelete,
    PostDelete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::PreInstall => "pre-install",
            Phase::PostInstall => "post-install",
            Phase::PreCreate => "pre-create",
            Phase::PostCreate => "post-create",
            Phase::PreUpdate => "pre-update",
            Phase::PostUpdate => "post-update",
            Phase::PreDelete => "pre-delete",
            Phase::PostDelete => "post-delete",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the installer and its collaborators.
///
/// The first five variants are produced by [`crate::ClusterClient`] implementations from
/// the API server response class; callers branch on them, never on message text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("immutable field change rejected for {key}: {message}")]
    ImmutableField { key: String, message: String },
    #[error("no rest mapping for {0}")]
    NoRestMapping(String),
    #[error("{key} rejected by the API server ({code}): {message}")]
    Rejected { key: String, code: u16, message: String },
    #[error("error in {phase} hook")]
    Callback {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
    #[error("resource {key} missing installer annotation {annotation}")]
    MissingLastApplied { key: String, annotation: &'static str },
    #[error("decoding last-applied configuration of {key}")]
    PatchDecode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{key} not ready after {attempts} attempts: {last}")]
    ReadinessTimeout { key: String, attempts: u32, last: String },
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("duplicate resource key {0}")]
    DuplicateKey(String),
    #[error("{op} {key}")]
    Operation {
        op: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wrap `source` with the operation and resource it failed on.
    pub fn op(op: &'static str, key: impl fmt::Display, source: Error) -> Self {
        Error::Operation { op, key: key.to_string(), source: Box::new(source) }
    }

    pub fn callback(phase: Phase, source: anyhow::Error) -> Self {
        Error::Callback { phase, source }
    }

    /// Innermost error below any `Operation` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self.root(), Error::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self.root(), Error::AlreadyExists(_)) }
    pub fn is_immutable(&self) -> bool { matches!(self.root(), Error::ImmutableField { .. }) }
    pub fn is_no_mapping(&self) -> bool { matches!(self.root(), Error::NoRestMapping(_)) }
    pub fn is_rejected(&self) -> bool { matches!(self.root(), Error::Rejected { .. }) }

    /// The message followed by every source, joined with ": ".
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut cur = std::error::Error::source(self);
        while let Some(e) = cur {
            out.push_str(": ");
            out.push_str(&e.to_string());
            cur = e.source();
        }
        out
    }

    /// Transport and unclassified server errors are worth another attempt; everything
    /// else is a definite answer.
    pub fn is_transient(&self) -> bool { matches!(self.root(), Error::Other(_)) }
}
