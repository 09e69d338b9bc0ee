use std::io::Read;
use std::time::Duration;

use super::error::TransportError;

const USER_AGENT: &str = concat!("ocr-update/", env!("CARGO_PKG_VERSION"));

/// A response whose body has not been read yet.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// The single operation the updater needs from an HTTP stack: a GET with a
/// bounded timeout, returning a streaming body.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// Blocking reqwest client
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Build a client that gives up on connecting after `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        let response = self.client.get(url).timeout(timeout).send()?;

        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}
