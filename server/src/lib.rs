// Library interface for the OTS certificate server
// Shared with the client binary for wire types, key/CSR generation and TLS plumbing

pub mod acme;
pub mod api;
pub mod certs;
pub mod config;
pub mod dns;
pub mod names;
pub mod net;
pub mod registry;
pub mod retry;
pub mod tls;
pub mod wire;
