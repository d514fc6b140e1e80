use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Registration rejected by server (HTTP {status}): {message}")]
    RegistrationRejected { status: u16, message: String },

    #[error("Certificate request rejected by server (HTTP {status}): {message}")]
    CertificateRejected { status: u16, message: String },

    #[error("Server returned an empty certificate chain")]
    EmptyChain,

    #[error("Could not reach {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages() {
        let err = ClientError::RegistrationRejected {
            status: 409,
            message: "Client already registered".to_string(),
        };
        assert!(err.to_string().contains("409"));
        assert!(err.to_string().contains("already registered"));

        let err = ClientError::CertificateRejected {
            status: 503,
            message: "Upstream service unavailable".to_string(),
        };
        assert!(err.to_string().starts_with("Certificate request rejected"));
    }

    #[test]
    fn test_transport_error() {
        let err = ClientError::Transport {
            url: "https://ots.example.com/register".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("ots.example.com/register"));
    }

    #[test]
    fn test_empty_chain_error() {
        assert_eq!(
            ClientError::EmptyChain.to_string(),
            "Server returned an empty certificate chain"
        );
    }
}
