//! Demo page served over the freshly issued certificate

use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response};

use ots_cert_server::tls::RequestHandler;

pub struct HelloPage {
    hostname: String,
}

impl HelloPage {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
        }
    }

    pub fn body(&self) -> String {
        format!(
            "Congratulations! {} is serving HTTPS with its own certificate.\n",
            self.hostname
        )
    }
}

#[async_trait]
impl RequestHandler for HelloPage {
    async fn handle(&self, _req: Request<Body>) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}
