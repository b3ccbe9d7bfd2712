use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use log::{debug, info};
use regex::Regex;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{TransmissionParameters, DEFAULT_PORT};
use crate::endpoint::Endpoint;
use crate::error::{EndpointError, ExchangeError};
use crate::exchange::Event;
use crate::message::header::COAP_SCHEME;
use crate::message::{CoapMessage, MessageType, RequestType};
use crate::transport::UdpTransport;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("cannot resolve {0}")]
    Resolve(String, #[source] io::Error),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("request failed: {0}")]
    Exchange(#[from] ExchangeError),
}

/// Where a client sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parses `host`, `host:port` or `coap://host[:port][/path]`. The port
/// defaults to [`DEFAULT_PORT`].
pub fn parse_target(target: &str) -> Result<Target, ClientError> {
    let invalid = || ClientError::InvalidTarget(target.to_string());

    let url = if target.contains("://") {
        Url::parse(target)
    } else {
        Url::parse(&format!("{}://{}", COAP_SCHEME, target))
    }
    .map_err(|_| invalid())?;

    if url.scheme() != COAP_SCHEME {
        return Err(invalid());
    }

    let host = match url.host_str() {
        Some("") | None => return Err(invalid()),
        Some(h) => h,
    };
    let host = Regex::new(r"^\[(.*?)]$")
        .map_err(|_| invalid())?
        .replace(host, "$1")
        .to_string();

    let port = url.port().unwrap_or(DEFAULT_PORT);
    let path = match url.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };

    Ok(Target { host, port, path })
}

/// Sends one request at a time to a single server and waits for the answer.
pub struct Client {
    endpoint: Endpoint<UdpTransport>,
    peer: SocketAddr,
}

impl Client {
    pub async fn connect(target: &Target, params: TransmissionParameters) -> Result<Client, ClientError> {
        let peer = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| ClientError::Resolve(target.host.clone(), e))?
            .next()
            .ok_or_else(|| {
                ClientError::Resolve(
                    target.host.clone(),
                    io::Error::new(io::ErrorKind::NotFound, "no address found"),
                )
            })?;

        let bind_addr = match peer {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let endpoint = Endpoint::bind(bind_addr, params).await?;
        debug!("bound to {}, talking to {}", endpoint.local_addr()?, peer);

        Ok(Client { endpoint, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.endpoint.shutdown_handle()
    }

    /// Sends `request` and returns the matching response. Requests from the
    /// server arriving meanwhile are ignored.
    pub async fn request(&mut self, request: CoapMessage) -> Result<CoapMessage, ClientError> {
        let handle = self.endpoint.send_request(self.peer, request).await?;

        loop {
            for event in self.endpoint.poll().await? {
                match event {
                    Event::Response { handle: h, message, .. } if h == handle => {
                        return Ok(message);
                    }
                    Event::Failed { handle: h, error, .. } if h == handle => {
                        return Err(error.into());
                    }
                    Event::Request { peer, message } => {
                        info!("ignoring request {:?} from {}", message, peer);
                    }
                    other => debug!("ignoring {:?}", other),
                }
            }
        }
    }

    pub async fn get(&mut self, path: &str) -> Result<CoapMessage, ClientError> {
        self.request(Self::build(RequestType::Get, path, Vec::new()))
            .await
    }

    pub async fn post(&mut self, path: &str, data: Vec<u8>) -> Result<CoapMessage, ClientError> {
        self.request(Self::build(RequestType::Post, path, data))
            .await
    }

    pub async fn put(&mut self, path: &str, data: Vec<u8>) -> Result<CoapMessage, ClientError> {
        self.request(Self::build(RequestType::Put, path, data))
            .await
    }

    pub async fn delete(&mut self, path: &str) -> Result<CoapMessage, ClientError> {
        self.request(Self::build(RequestType::Delete, path, Vec::new()))
            .await
    }

    pub fn close(&mut self) {
        self.endpoint.close();
    }

    fn build(method: RequestType, path: &str, data: Vec<u8>) -> CoapMessage {
        let mut request = CoapMessage::new_request(MessageType::Confirmable, method);
        request.set_path(path);
        request.payload = data;
        request
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_target_good() {
        assert_eq!(
            parse_target("localhost").unwrap(),
            Target {
                host: "localhost".to_string(),
                port: DEFAULT_PORT,
                path: "/".to_string()
            }
        );
        assert_eq!(parse_target("127.0.0.1:5683").unwrap().port, 5683);
        assert_eq!(parse_target("coap://[::1]").unwrap().host, "::1");
        assert_eq!(
            parse_target("coap://[bbbb::9329:f033:f558:7418]:5683/sensors/temp").unwrap(),
            Target {
                host: "bbbb::9329:f033:f558:7418".to_string(),
                port: 5683,
                path: "/sensors/temp".to_string()
            }
        );
    }

    #[test]
    fn test_parse_target_bad() {
        assert!(parse_target("coap://127.0.0.1:65536").is_err());
        assert!(parse_target("coap://").is_err());
        assert!(parse_target("coap://:5683").is_err());
        assert!(parse_target("http://127.0.0.1").is_err());
    }
}
