//! A small [CoAP][rfc] endpoint over UDP.
//!
//! The crate is split in three layers:
//! - [`message`]: the wire codec and the option table
//! - [`exchange`]: an I/O-free state machine for confirmable retransmission,
//!   duplicate detection and request/response matching
//! - [`Endpoint`]: binds the state machine to a UDP socket
//!
//! [`Client`] and [`Server`] are thin conveniences on top of [`Endpoint`].
//!
//! Not covered: DTLS, observe, block-wise transfer, proxying and multicast.
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use coapss::message::{CoapMessage, ContentFormat, ResponseType};
//! use coapss::{Server, TransmissionParameters};
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr = "127.0.0.1:1818".parse().unwrap();
//!     let mut server = Server::bind(addr, TransmissionParameters::default())
//!         .await
//!         .unwrap();
//!
//!     server
//!         .run(|peer, request| {
//!             println!("request from {} for {}", peer, request.get_path());
//!             let mut response = CoapMessage::new_response(ResponseType::Content);
//!             response.set_content_format(ContentFormat::TextPlain);
//!             response.payload = b"OK".to_vec();
//!             Some(response)
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use coapss::client::parse_target;
//! use coapss::{Client, TransmissionParameters};
//!
//! #[tokio::main]
//! async fn main() {
//!     let target = parse_target("coap://127.0.0.1:1818/hello").unwrap();
//!     let mut client = Client::connect(&target, TransmissionParameters::default())
//!         .await
//!         .unwrap();
//!
//!     let response = client.get(&target.path).await.unwrap();
//!     println!("Server reply: {}", String::from_utf8_lossy(&response.payload));
//! }
//! ```
//!
//! ## Endpoint:
//! ```no_run
//! use coapss::message::{CoapMessage, MessageType, RequestType};
//! use coapss::{open_endpoint, Event};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut endpoint = open_endpoint(0).await.unwrap();
//!     let mut request = CoapMessage::new_request(MessageType::Confirmable, RequestType::Get);
//!     request.set_path("sensors/temp");
//!     endpoint
//!         .send_request("127.0.0.1:1818".parse().unwrap(), request)
//!         .await
//!         .unwrap();
//!
//!     loop {
//!         for event in endpoint.poll().await.unwrap() {
//!             match event {
//!                 Event::Response { message, .. } => {
//!                     println!("{:?}", message);
//!                     return;
//!                 }
//!                 Event::Failed { error, .. } => {
//!                     println!("{}", error);
//!                     return;
//!                 }
//!                 Event::Request { .. } => {}
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! [rfc]: https://tools.ietf.org/rfc/rfc7252.txt

#[cfg(test)]
extern crate quickcheck;

pub use self::client::{Client, ClientError};
pub use self::config::TransmissionParameters;
pub use self::endpoint::{open_endpoint, Endpoint, Events};
pub use self::error::{DecodeError, EncodeError, EndpointError, ExchangeError};
pub use self::exchange::{Event, RequestHandle};
pub use self::message::CoapMessage;
pub use self::server::Server;

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod message;
pub mod server;
pub mod transport;
