use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use log::{debug, error, trace};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{TransmissionParameters, COAP_MTU};
use crate::error::EndpointError;
use crate::exchange::{Event, Exchange, RequestHandle};
use crate::message::CoapMessage;
use crate::transport::{Transport, UdpTransport};

/// Binds a UDP endpoint on all IPv4 interfaces with default parameters.
pub async fn open_endpoint(local_port: u16) -> Result<Endpoint<UdpTransport>, EndpointError> {
    let transport = UdpTransport::bind((Ipv4Addr::UNSPECIFIED, local_port)).await?;
    Ok(Endpoint::new(transport, TransmissionParameters::default()))
}

/// Events returned by one [`Endpoint::poll`] call.
pub struct Events {
    inner: std::vec::IntoIter<Event>,
}

impl Iterator for Events {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Events {}

enum Wake {
    Shutdown,
    Datagram(usize, SocketAddr),
    Timer,
}

/// A socket plus the exchange state that belongs to it.
///
/// Everything runs on the task calling the endpoint's methods; nothing is
/// shared, so no locking is involved. Socket errors end the endpoint and
/// are handed back to the caller.
pub struct Endpoint<T: Transport> {
    transport: Option<T>,
    exchange: Exchange,
    shutdown: CancellationToken,
    recv_buf: Vec<u8>,
}

impl Endpoint<UdpTransport> {
    pub async fn bind(addr: SocketAddr, params: TransmissionParameters) -> Result<Self, EndpointError> {
        let transport = UdpTransport::bind(addr).await?;
        Ok(Endpoint::new(transport, params))
    }
}

impl<T: Transport> Endpoint<T> {
    pub fn new(transport: T, params: TransmissionParameters) -> Endpoint<T> {
        Self::with_exchange(transport, Exchange::new(params))
    }

    pub fn with_exchange(transport: T, exchange: Exchange) -> Endpoint<T> {
        // One spare byte tells an oversized datagram from a full one.
        let recv_len = COAP_MTU.max(exchange.params().max_message_size) + 1;
        Endpoint {
            transport: Some(transport),
            exchange,
            shutdown: CancellationToken::new(),
            recv_buf: vec![0u8; recv_len],
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EndpointError> {
        Ok(self.transport()?.local_addr()?)
    }

    /// Cancelling the returned token makes the next [`Endpoint::poll`]
    /// close the endpoint.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Sends a request and starts tracking it. Encoding problems are
    /// reported before anything reaches the socket.
    pub async fn send_request(
        &mut self,
        peer: SocketAddr,
        message: CoapMessage,
    ) -> Result<RequestHandle, EndpointError> {
        self.transport()?;
        let handle = self.exchange.send_request(Instant::now(), peer, message)?;
        self.flush().await?;
        Ok(handle)
    }

    /// Replies to a request received through [`Endpoint::poll`].
    pub async fn respond(
        &mut self,
        peer: SocketAddr,
        request: &CoapMessage,
        response: CoapMessage,
    ) -> Result<(), EndpointError> {
        self.transport()?;
        self.exchange.respond(peer, request, response)?;
        self.flush().await
    }

    pub fn cancel(&mut self, handle: &RequestHandle) -> bool {
        self.exchange.cancel(handle)
    }

    /// Waits for traffic, the next retransmission deadline or shutdown,
    /// then returns whatever the exchange layer produced. The result may be
    /// empty; call again on the next loop iteration.
    pub async fn poll(&mut self) -> Result<Events, EndpointError> {
        let transport = match self.transport.as_ref() {
            Some(transport) => transport,
            None => return Err(EndpointError::Closed),
        };

        let deadline = self.exchange.next_deadline();
        let wake = tokio::select! {
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            received = transport.recv_from(&mut self.recv_buf) => {
                let (n, peer) = received.map_err(|e| {
                    error!("receive failed: {}", e);
                    e
                })?;
                Wake::Datagram(n, peer)
            }
            _ = sleep_until(deadline) => Wake::Timer,
        };

        match wake {
            Wake::Shutdown => {
                debug!("shutdown requested");
                self.close();
                return Err(EndpointError::Closed);
            }
            Wake::Datagram(n, peer) => {
                self.accept(n, peer);
                self.drain_socket()?;
            }
            Wake::Timer => trace!("timer wake-up"),
        }

        self.exchange.handle_timeouts(Instant::now());
        self.flush().await?;

        let events: Vec<Event> = std::iter::from_fn(|| self.exchange.poll_event()).collect();
        Ok(Events {
            inner: events.into_iter(),
        })
    }

    /// Cancels every outstanding exchange without touching the network and
    /// releases the socket.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            let cancelled = self.exchange.cancel_all();
            debug!("endpoint closed, {} requests cancelled", cancelled);
        }
        self.shutdown.cancel();
    }

    fn transport(&self) -> Result<&T, EndpointError> {
        self.transport.as_ref().ok_or(EndpointError::Closed)
    }

    // Picks up datagrams that queued while the last one was processed.
    fn drain_socket(&mut self) -> Result<(), EndpointError> {
        loop {
            let transport = self.transport.as_ref().ok_or(EndpointError::Closed)?;
            match transport.try_recv_from(&mut self.recv_buf) {
                Ok((n, peer)) => self.accept(n, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn accept(&mut self, n: usize, peer: SocketAddr) {
        let limit = self.recv_buf.len() - 1;
        if n > limit {
            debug!("dropping datagram from {}: larger than {} bytes", peer, limit);
            return;
        }
        self.exchange
            .handle_datagram(Instant::now(), peer, &self.recv_buf[..n]);
    }

    async fn flush(&mut self) -> Result<(), EndpointError> {
        let transport = self.transport.as_ref().ok_or(EndpointError::Closed)?;
        while let Some(transmit) = self.exchange.poll_transmit() {
            trace!("transmit {} bytes to {}", transmit.payload.len(), transmit.peer);
            transport
                .send_to(&transmit.payload, transmit.peer)
                .await
                .map_err(|e| {
                    error!("send to {} failed: {}", transmit.peer, e);
                    e
                })?;
        }
        Ok(())
    }
}

impl<T: Transport> Drop for Endpoint<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ExchangeError;
    use crate::message::{encode_with_limit, MessageType, RequestType, ResponseType};
    use std::time::Duration;
    use tokio_test::assert_ok;

    async fn loopback(params: TransmissionParameters) -> Endpoint<UdpTransport> {
        Endpoint::bind("127.0.0.1:0".parse().unwrap(), params)
            .await
            .unwrap()
    }

    async fn next_event(endpoint: &mut Endpoint<UdpTransport>) -> Event {
        let wait = async {
            loop {
                if let Some(event) = endpoint.poll().await.unwrap().next() {
                    return event;
                }
            }
        };
        time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_request_response_over_udp() {
        let mut server = loopback(TransmissionParameters::default()).await;
        let mut client = loopback(TransmissionParameters::default()).await;
        let server_addr = server.local_addr().unwrap();

        let mut request = CoapMessage::new_request(MessageType::Confirmable, RequestType::Get);
        request.set_path("hello");
        let handle = client.send_request(server_addr, request).await.unwrap();

        let (peer, received) = match next_event(&mut server).await {
            Event::Request { peer, message } => (peer, message),
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(received.get_path(), "hello");
        assert_eq!(received.token(), handle.token.as_slice());

        let mut response = CoapMessage::new_response(ResponseType::Content);
        response.payload = b"world".to_vec();
        assert_ok!(server.respond(peer, &received, response).await);

        match next_event(&mut client).await {
            Event::Response { handle: h, message, .. } => {
                assert_eq!(h, handle);
                assert_eq!(message.message_type, MessageType::Acknowledgement);
                assert_eq!(message.payload, b"world".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_fails() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let params = TransmissionParameters {
            ack_timeout: Duration::from_millis(20),
            ack_random_factor: 1.0,
            max_retransmit: 2,
            ..TransmissionParameters::default()
        };
        let mut client = loopback(params).await;

        let request = CoapMessage::new_request(MessageType::Confirmable, RequestType::Get);
        let handle = client
            .send_request(silent.local_addr().unwrap(), request)
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut client).await,
            Event::Failed {
                peer: silent.local_addr().unwrap(),
                handle,
                error: ExchangeError::Timeout
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_handle_closes_endpoint() {
        let mut endpoint = loopback(TransmissionParameters::default()).await;
        let request = CoapMessage::new_request(MessageType::Confirmable, RequestType::Get);
        endpoint
            .send_request("127.0.0.1:9".parse().unwrap(), request)
            .await
            .unwrap();

        endpoint.shutdown_handle().cancel();
        assert!(matches!(endpoint.poll().await, Err(EndpointError::Closed)));
        assert!(endpoint.is_closed());
        assert!(matches!(
            endpoint
                .send_request(
                    "127.0.0.1:9".parse().unwrap(),
                    CoapMessage::new_request(MessageType::Confirmable, RequestType::Get)
                )
                .await,
            Err(EndpointError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped() {
        let mut endpoint = loopback(TransmissionParameters::default()).await;
        let addr = endpoint.local_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut large = CoapMessage::new_request(MessageType::NonConfirmable, RequestType::Post);
        large.message_id = 1;
        large.set_path("large");
        large.payload = vec![0x55; 1400];
        let bytes = encode_with_limit(&large, usize::MAX).unwrap();
        assert!(bytes.len() > COAP_MTU);
        sender.send_to(&bytes, addr).unwrap();

        let mut small = CoapMessage::new_request(MessageType::NonConfirmable, RequestType::Post);
        small.message_id = 2;
        small.set_path("small");
        small.payload = b"ok".to_vec();
        sender.send_to(&small.to_bytes().unwrap(), addr).unwrap();

        match next_event(&mut endpoint).await {
            Event::Request { message, .. } => {
                assert_eq!(message.get_path(), "small");
                assert_eq!(message.payload, b"ok".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_encode_error_rejected_before_send() {
        let mut endpoint = loopback(TransmissionParameters::default()).await;
        let mut request = CoapMessage::new_request(MessageType::NonConfirmable, RequestType::Post);
        request.payload = vec![0; COAP_MTU];
        assert!(matches!(
            endpoint
                .send_request("127.0.0.1:9".parse().unwrap(), request)
                .await,
            Err(EndpointError::Encode(_))
        ));
    }
}
