use crate::registers::Request;
use std::future::Future;
use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("`{1}` is not a usable device address")]
    InvalidAddress(#[source] reqwest::Error, String),
    #[error("could not send `{1}` to the device")]
    Post(#[source] reqwest::Error, String),
    #[error("device responded to `{1}` with HTTP status {0}")]
    Status(reqwest::StatusCode, String),
    #[error("could not read the device response to `{1}`")]
    ReadBody(#[source] reqwest::Error, String),
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// IP address or host name (optionally with a `:port`) of the Sanremo Cube.
    #[arg(long, short = 'a')]
    address: String,

    /// Consider a request failed if the device does not respond within this amount of time.
    ///
    /// By default requests wait for as long as the device keeps the connection open.
    #[arg(long)]
    timeout: Option<humantime::Duration>,
}

/// Capability to deliver a request body to the device and retrieve the response body.
///
/// The device adapter is generic over this so that it never reaches for an ambient client.
pub trait Transport: Send + Sync {
    fn post(&self, request: Request) -> impl Future<Output = Result<String, Error>> + Send;
}

/// [`Transport`] talking plaintext HTTP to `http://<address>/ajax/post`.
pub struct HttpTransport {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpTransport {
    pub fn new(args: &Args) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = args.timeout {
            builder = builder.timeout(*timeout);
        }
        let client = builder.build().map_err(Error::CreateReqwest)?;
        Self::with_client(client, &args.address)
    }

    pub fn with_client(client: reqwest::Client, address: &str) -> Result<Self, Error> {
        let url = post_url(&client, address)?;
        debug!(message = "device endpoint", %url);
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

fn post_url(client: &reqwest::Client, address: &str) -> Result<reqwest::Url, Error> {
    let candidate = format!("http://{address}/ajax/post");
    client
        .post(candidate.as_str())
        .build()
        .map(|request| request.url().clone())
        .map_err(|e| Error::InvalidAddress(e, address.to_string()))
}

impl Transport for HttpTransport {
    async fn post(&self, request: Request) -> Result<String, Error> {
        let body = request.body();
        trace!(message = "posting", url = %self.url, body);
        let response = self
            .client
            .post(self.url.clone())
            .body(body.clone())
            .send()
            .await
            .map_err(|e| Error::Post(e, body.clone()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status, body));
        }
        let text = response.text().await.map_err(|e| Error::ReadBody(e, body.clone()))?;
        trace!(message = "received", body, response = text);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url() {
        let transport = HttpTransport::with_client(reqwest::Client::new(), "192.168.1.50")
            .expect("valid address");
        assert_eq!(transport.url().as_str(), "http://192.168.1.50/ajax/post");
        let transport = HttpTransport::with_client(reqwest::Client::new(), "cube.local:8080")
            .expect("valid address");
        assert_eq!(transport.url().as_str(), "http://cube.local:8080/ajax/post");
    }

    #[test]
    fn bad_address() {
        let result = HttpTransport::with_client(reqwest::Client::new(), "not a host");
        assert!(matches!(result, Err(Error::InvalidAddress(_, a)) if a == "not a host"));
    }
}
