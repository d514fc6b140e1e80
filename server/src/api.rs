//! Registration protocol handler
//!
//! Validates and serves the two client exchanges:
//!
//! - `POST /register` - bind a client identity to a fresh hostname and
//!   publish its A record
//! - `POST /get_certificate` - issue a certificate for the hostname bound to
//!   an identity. The hostname always comes from the registration store,
//!   never from the CSR.
//! - `GET /` - welcome string
//!
//! Failures never take the process down; each maps to an HTTP status and a
//! `success: false` body.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acme::{CertificateIssuer, ValidationError};
use crate::dns::{DnsRecordManager, RecordType};
use crate::net::is_private_address;
use crate::registry::{RegistrationStore, RegistryError};
use crate::tls::RequestHandler;
use crate::wire::{
    CertificateRequest, CertificateResponse, ErrorResponse, RegisterRequest, RegisterResponse,
};

/// Request bodies above this size are rejected
pub const MAX_BODY_BYTES: usize = 64 * 1024;

pub const WELCOME_MESSAGE: &str = "Welcome to the OTS certificate server";

/// Handler errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid client ID: {0}")]
    InvalidIdentity(String),

    #[error("Address {0} is not in a private range")]
    NonPrivateAddress(IpAddr),

    #[error("Client {0} is already registered")]
    AlreadyRegistered(Uuid),

    #[error("Client {0} is not registered")]
    UnknownClient(Uuid),

    #[error("Certificate issuance for {0} is already in progress")]
    IssuanceInProgress(String),

    #[error("Upstream service unavailable: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::InvalidIdentity(_)
            | ApiError::NonPrivateAddress(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyRegistered(_) | ApiError::IssuanceInProgress(_) => StatusCode::CONFLICT,
            ApiError::UnknownClient(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateIdentity(id) => ApiError::AlreadyRegistered(id),
            RegistryError::NotFound(id) => ApiError::UnknownClient(id),
            RegistryError::Database(e) => ApiError::Upstream(format!("registration store: {}", e)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::IssuanceInProgress(domain) => ApiError::IssuanceInProgress(domain),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

fn parse_identity(client_id: &str) -> Result<Uuid, ApiError> {
    let id = Uuid::parse_str(client_id.trim())
        .map_err(|e| ApiError::InvalidIdentity(format!("'{}': {}", client_id, e)))?;
    if id.is_nil() {
        return Err(ApiError::InvalidIdentity("nil UUID".to_string()));
    }
    Ok(id)
}

/// Shared state behind the HTTP endpoints
pub struct ProvisioningService {
    store: Arc<RegistrationStore>,
    dns: DnsRecordManager,
    issuer: Arc<dyn CertificateIssuer>,
    domain: String,
}

impl ProvisioningService {
    pub fn new(
        store: Arc<RegistrationStore>,
        dns: DnsRecordManager,
        issuer: Arc<dyn CertificateIssuer>,
        domain: &str,
    ) -> Self {
        Self {
            store,
            dns,
            issuer,
            domain: domain.trim_end_matches('.').to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register `client_id` at `ip`; returns the assigned FQDN
    pub async fn register(&self, client_id: &str, ip: &str) -> Result<String, ApiError> {
        let identity = parse_identity(client_id)?;
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ApiError::InvalidRequest(format!("malformed IP address '{}'", ip)))?;
        if !is_private_address(&ip) {
            return Err(ApiError::NonPrivateAddress(ip));
        }

        let ip = ip.to_canonical();

        let registration = self.store.register_client(identity, ip).await?;
        let fqdn = registration.fqdn(&self.domain);

        // The binding is committed; a missing A record is repaired on the
        // certificate request, so the client still learns its hostname
        if let Err(e) = self
            .dns
            .reconcile(RecordType::A, &fqdn, &ip.to_string())
            .await
        {
            warn!(hostname = %fqdn, error = %e, "Could not publish A record at registration");
        }

        info!(client_id = %identity, hostname = %fqdn, "Registration complete");
        Ok(fqdn)
    }

    /// Issue a certificate for the hostname bound to `client_id`
    pub async fn request_certificate(
        &self,
        client_id: &str,
        csr_der: &[u8],
    ) -> Result<Vec<Vec<u8>>, ApiError> {
        let identity = parse_identity(client_id)?;
        if csr_der.is_empty() {
            return Err(ApiError::InvalidRequest("empty CSR".to_string()));
        }

        let registration = self.store.lookup_client(identity).await?;
        let fqdn = registration.fqdn(&self.domain);

        // Repairs a registration whose A record never made it out
        if let Err(e) = self
            .dns
            .reconcile(RecordType::A, &fqdn, &registration.ip.to_string())
            .await
        {
            warn!(hostname = %fqdn, error = %e, "Could not refresh A record before issuance");
        }

        let chain = self.issuer.issue(&fqdn, csr_der).await?;
        info!(client_id = %identity, hostname = %fqdn, certificates = chain.len(), "Certificate delivered");
        Ok(chain)
    }

    /// Route one HTTP request
    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, path = %path, "Handling request");

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/") => text_response(StatusCode::OK, WELCOME_MESSAGE),
            (&Method::POST, "/register") => self.handle_register(req).await,
            (&Method::POST, "/get_certificate") => self.handle_get_certificate(req).await,
            _ => json_response(
                StatusCode::NOT_FOUND,
                &ErrorResponse::new(format!("No route for {} {}", method, path)),
            ),
        };

        Ok(response)
    }

    async fn handle_register(&self, req: Request<Body>) -> Response<Body> {
        let result = match parse_body::<RegisterRequest>(req).await {
            Ok(request) => self.register(&request.client_id, &request.ip).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(hostname) => json_response(
                StatusCode::OK,
                &RegisterResponse {
                    success: true,
                    message: "Client registered successfully".to_string(),
                    hostname,
                },
            ),
            Err(e) => {
                warn!(error = %e, "Registration failed");
                json_response(
                    e.status(),
                    &RegisterResponse {
                        success: false,
                        message: e.to_string(),
                        hostname: String::new(),
                    },
                )
            }
        }
    }

    async fn handle_get_certificate(&self, req: Request<Body>) -> Response<Body> {
        let result = match parse_body::<CertificateRequest>(req).await {
            Ok(request) => self.request_certificate(&request.client_id, &request.csr).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(certificates) => json_response(
                StatusCode::OK,
                &CertificateResponse {
                    success: true,
                    message: "Certificate issued successfully".to_string(),
                    certificates,
                },
            ),
            Err(e) => {
                warn!(error = %e, "Certificate request failed");
                json_response(
                    e.status(),
                    &CertificateResponse {
                        success: false,
                        message: e.to_string(),
                        certificates: Vec::new(),
                    },
                )
            }
        }
    }
}

#[async_trait]
impl RequestHandler for ProvisioningService {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match self.handle_request(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// Read and decode a JSON body of at most [`MAX_BODY_BYTES`]
async fn parse_body<T: DeserializeOwned>(req: Request<Body>) -> Result<T, ApiError> {
    let mut body = req.into_body();
    let mut bytes = Vec::new();

    while let Some(chunk) = body.data().await {
        let chunk =
            chunk.map_err(|e| ApiError::InvalidRequest(format!("Failed to read body: {}", e)))?;
        if bytes.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(ApiError::InvalidRequest(format!(
                "body exceeds {} bytes",
                MAX_BODY_BYTES
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
