use std::sync::Arc;

use openssh::{KnownHosts, Session};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: openssh::Error,
    },

    #[error("authentication to {destination} was rejected: {source}")]
    Authentication {
        destination: String,
        #[source]
        source: openssh::Error,
    },

    #[error("ssh session failed: {0}")]
    Session(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

/// Open a session to `target`, adding unknown host keys to `known_hosts`.
pub async fn connect(target: &SshTarget) -> Result<Arc<Session>, TransportError> {
    let destination = target.destination();
    debug!(destination = %destination, "Connecting to SSH destination");
    match Session::connect(&destination, KnownHosts::Add).await {
        Ok(session) => Ok(Arc::new(session)),
        Err(source) if is_auth_failure(&source.to_string()) => {
            Err(TransportError::Authentication {
                destination,
                source,
            })
        }
        Err(source) => Err(TransportError::Connect {
            destination,
            source,
        }),
    }
}

/// ssh reports rejected keys and passwords with this phrase.
fn is_auth_failure(message: &str) -> bool {
    message.contains("Permission denied")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(user: Option<&str>, port: Option<u16>) -> SshTarget {
        SshTarget {
            user: user.map(str::to_string),
            host: "nas.local".to_string(),
            port,
        }
    }

    #[test]
    fn destination_forms() {
        assert_eq!(target(None, None).destination(), "ssh://nas.local");
        assert_eq!(target(Some("root"), None).destination(), "ssh://root@nas.local");
        assert_eq!(target(None, Some(2222)).destination(), "ssh://nas.local:2222");
        assert_eq!(
            target(Some("root"), Some(2222)).destination(),
            "ssh://root@nas.local:2222"
        );
    }

    #[test]
    fn detects_rejected_credentials() {
        assert!(is_auth_failure(
            "failed to connect to the remote host: root@nas.local: Permission denied (publickey,password)."
        ));
        assert!(!is_auth_failure("ssh: connect to host nas.local port 22: Connection refused"));
    }
}
