use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::TransmissionParameters;
use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::exchange::Event;
use crate::message::CoapMessage;
use crate::transport::{Transport, UdpTransport};

/// Answers requests with a handler until shut down.
pub struct Server<T: Transport = UdpTransport> {
    endpoint: Endpoint<T>,
}

impl Server<UdpTransport> {
    /// Creates a CoAP server listening on the given address.
    pub async fn bind(addr: SocketAddr, params: TransmissionParameters) -> Result<Self, EndpointError> {
        Ok(Server {
            endpoint: Endpoint::bind(addr, params).await?,
        })
    }
}

impl<T: Transport> Server<T> {
    pub fn from_endpoint(endpoint: Endpoint<T>) -> Server<T> {
        Server { endpoint }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EndpointError> {
        self.endpoint.local_addr()
    }

    /// Cancelling the token stops [`Server::run`].
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.endpoint.shutdown_handle()
    }

    /// Runs the receive loop. The handler sees each request once; returning
    /// `None` leaves the request unanswered. Returns `Ok` after shutdown and
    /// `Err` if the socket fails.
    pub async fn run<H>(&mut self, mut handler: H) -> Result<(), EndpointError>
    where
        H: FnMut(SocketAddr, &CoapMessage) -> Option<CoapMessage>,
    {
        info!("server up on {}", self.endpoint.local_addr()?);

        loop {
            let events = match self.endpoint.poll().await {
                Ok(events) => events,
                Err(EndpointError::Closed) => {
                    info!("server stopped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            for event in events {
                let (peer, request) = match event {
                    Event::Request { peer, message } => (peer, message),
                    other => {
                        debug!("server ignoring {:?}", other);
                        continue;
                    }
                };

                let response = match handler(peer, &request) {
                    Some(response) => response,
                    None => continue,
                };

                match self.endpoint.respond(peer, &request, response).await {
                    Ok(()) => {}
                    Err(EndpointError::Encode(e)) => {
                        warn!("dropping response to {}: {}", peer, e)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{Client, Target};
    use crate::message::{CoapOption, ResponseType};
    use std::time::Duration;
    use tokio::time;

    fn echo_path(_peer: SocketAddr, request: &CoapMessage) -> Option<CoapMessage> {
        let uri_path = request.get_first_option(CoapOption::UriPath)?.to_vec();
        let mut response = CoapMessage::new_response(ResponseType::Content);
        response.payload = uri_path;
        Some(response)
    }

    #[tokio::test]
    async fn test_echo_server() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), TransmissionParameters::default())
            .await
            .unwrap();
        let server_port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_handle();
        let running = tokio::spawn(async move { server.run(echo_path).await });

        let target = Target {
            host: "127.0.0.1".to_string(),
            port: server_port,
            path: "/".to_string(),
        };
        let mut client = Client::connect(&target, TransmissionParameters::default())
            .await
            .unwrap();

        let response = time::timeout(Duration::from_secs(5), client.get("test-echo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.payload, b"test-echo".to_vec());

        let response = time::timeout(Duration::from_secs(5), client.post("other", b"x".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.payload, b"other".to_vec());

        shutdown.cancel();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), TransmissionParameters::default())
            .await
            .unwrap();
        let server_port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_handle();
        let running = tokio::spawn(async move { server.run(|_, _| None).await });

        let params = TransmissionParameters {
            ack_timeout: Duration::from_millis(20),
            ack_random_factor: 1.0,
            max_retransmit: 1,
            ..TransmissionParameters::default()
        };
        let target = Target {
            host: "127.0.0.1".to_string(),
            port: server_port,
            path: "/".to_string(),
        };
        let mut client = Client::connect(&target, params).await.unwrap();

        let result = time::timeout(Duration::from_secs(5), client.get("nothing"))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(crate::client::ClientError::Exchange(crate::error::ExchangeError::Timeout))
        ));

        shutdown.cancel();
        assert!(running.await.unwrap().is_ok());
    }
}
