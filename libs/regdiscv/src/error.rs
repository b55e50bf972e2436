use crate::coordination::CoordError;

/// Errors surfaced by the registration, discovery and election layers
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The coordination service cannot be reached.
    #[error("coordination service unreachable: {0}")]
    Connection(String),

    /// The service was used before `start()` or after `stop()`.
    #[error("registration service is not started")]
    NotStarted,

    /// Creating a registration node failed.
    #[error("failed to write node {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: CoordError,
    },

    /// Module or key absent, or present with no servers.
    #[error("no servers found for {0}")]
    NotFound(String),

    /// A watch or children listing failed with a non-transient error.
    #[error("watch on {path} failed: {source}")]
    Watch {
        path: String,
        #[source]
        source: CoordError,
    },

    /// A registered payload could not be decoded.
    #[error("failed to decode payload of {module}: {message}")]
    Decode { module: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn write(path: impl Into<String>, source: CoordError) -> Self {
        match source {
            CoordError::ConnectionLoss(msg) => Self::Connection(msg),
            other => Self::Write {
                path: path.into(),
                source: other,
            },
        }
    }

    pub(crate) fn watch(path: impl Into<String>, source: CoordError) -> Self {
        match source {
            CoordError::ConnectionLoss(msg) => Self::Connection(msg),
            other => Self::Watch {
                path: path.into(),
                source: other,
            },
        }
    }

    /// Returns `true` for errors a background loop may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
            || matches!(
                self,
                Self::Watch {
                    source: CoordError::NoNode(_),
                    ..
                }
            )
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_maps_to_connection_error() {
        let err = Error::write("/a", CoordError::ConnectionLoss("refused".to_owned()));
        assert!(matches!(err, Error::Connection(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn no_node_watch_error_is_retryable() {
        let err = Error::watch("/a", CoordError::NoNode("/a".to_owned()));
        assert!(err.is_retryable());

        let err = Error::watch("/a", CoordError::Other("denied".to_owned()));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "watch on /a failed: coordination error: denied");
    }
}
