//! Client side of the registration exchange

use std::net::Ipv4Addr;
use std::path::Path;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use ots_cert_server::wire::{
    CertificateRequest, CertificateResponse, RegisterRequest, RegisterResponse,
};

use crate::errors::ClientError;

pub struct ProvisioningClient {
    http: Client,
    registration_url: String,
    certificate_url: String,
}

impl ProvisioningClient {
    pub fn new(
        registration_url: String,
        certificate_url: String,
        ca_certificate: Option<&Path>,
    ) -> Result<Self, ClientError> {
        let mut builder = Client::builder();
        if let Some(path) = ca_certificate {
            let pem = std::fs::read(path).map_err(|e| {
                ClientError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClientError::ConfigError(format!("Invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        let http = builder
            .build()
            .map_err(|e| ClientError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            registration_url,
            certificate_url,
        })
    }

    /// POST `body` to `url`, returning the HTTP status and decoded JSON body
    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(u16, R), ClientError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let decoded = response
            .json::<R>()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                url: url.to_string(),
                message: format!("HTTP {}: {}", status, e),
            })?;

        debug!(url = %url, status, "Server responded");
        Ok((status, decoded))
    }

    /// Register `identity` at `ip`; returns the assigned FQDN
    pub async fn register(&self, identity: Uuid, ip: Ipv4Addr) -> Result<String, ClientError> {
        let request = RegisterRequest {
            client_id: identity.to_string(),
            ip: ip.to_string(),
        };
        let (status, response): (u16, RegisterResponse) =
            self.post(&self.registration_url, &request).await?;

        if !response.success || response.hostname.is_empty() {
            return Err(ClientError::RegistrationRejected {
                status,
                message: response.message,
            });
        }

        Ok(response.hostname)
    }

    /// Send a DER CSR; returns the chain as DER certificates, leaf first
    pub async fn request_certificate(
        &self,
        identity: Uuid,
        csr_der: &[u8],
    ) -> Result<Vec<Vec<u8>>, ClientError> {
        let request = CertificateRequest {
            client_id: identity.to_string(),
            csr: csr_der.to_vec(),
        };
        let (status, response): (u16, CertificateResponse) =
            self.post(&self.certificate_url, &request).await?;

        if !response.success {
            return Err(ClientError::CertificateRejected {
                status,
                message: response.message,
            });
        }
        if response.certificates.is_empty() {
            return Err(ClientError::EmptyChain);
        }

        Ok(response.certificates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    /// Serve one canned status/body pair for every request; returns the base URL
    async fn fake_server(status: StatusCode, body: &'static str) -> String {
        let make_svc = make_service_fn(move |_| async move {
            Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
            }))
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    fn client_for(base: &str) -> ProvisioningClient {
        ProvisioningClient::new(
            format!("{}/register", base),
            format!("{}/get_certificate", base),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_returns_hostname() {
        let base = fake_server(
            StatusCode::OK,
            r#"{"success":true,"message":"Registered","hostname":"eager-turing.example.com"}"#,
        )
        .await;

        let hostname = client_for(&base)
            .register(Uuid::new_v4(), Ipv4Addr::new(10, 0, 0, 5))
            .await
            .unwrap();
        assert_eq!(hostname, "eager-turing.example.com");
    }

    #[tokio::test]
    async fn test_register_surfaces_server_message() {
        let base = fake_server(
            StatusCode::CONFLICT,
            r#"{"success":false,"message":"Client already registered"}"#,
        )
        .await;

        let err = client_for(&base)
            .register(Uuid::new_v4(), Ipv4Addr::new(10, 0, 0, 5))
            .await
            .unwrap_err();
        match err {
            ClientError::RegistrationRejected { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "Client already registered");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_certificate_chain_decoded() {
        // "AQID" and "BAU=" are base64 for [1, 2, 3] and [4, 5]
        let base = fake_server(
            StatusCode::OK,
            r#"{"success":true,"message":"Issued","certificates":["AQID","BAU="]}"#,
        )
        .await;

        let chain = client_for(&base)
            .request_certificate(Uuid::new_v4(), &[0x30, 0x00])
            .await
            .unwrap();
        assert_eq!(chain, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[tokio::test]
    async fn test_empty_chain_rejected() {
        let base = fake_server(
            StatusCode::OK,
            r#"{"success":true,"message":"Issued","certificates":null}"#,
        )
        .await;

        let err = client_for(&base)
            .request_certificate(Uuid::new_v4(), &[0x30, 0x00])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyChain));
    }

    #[tokio::test]
    async fn test_non_json_response() {
        let base = fake_server(StatusCode::BAD_GATEWAY, "upstream down").await;

        let err = client_for(&base)
            .register(Uuid::new_v4(), Ipv4Addr::new(10, 0, 0, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse { .. }));
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Port 9 on loopback has no listener
        let err = client_for("http://127.0.0.1:9")
            .register(Uuid::new_v4(), Ipv4Addr::new(10, 0, 0, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }
}
