use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{CommandFactory, Parser, ValueEnum};
use log::info;
use simplelog::{ColorChoice, LevelFilter, SimpleLogger, TermLogger, TerminalMode};

use coapss::client::parse_target;
use coapss::config::MAX_RETRANSMIT_LIMIT;
use coapss::message::header::code_to_str;
use coapss::message::{CoapMessage, ContentFormat, MessageType, RequestType, ResponseType};
use coapss::{Client, Server, TransmissionParameters};

/// A simple utility for talking CoAP over UDP
#[derive(Parser, Debug)]
#[command(name = "coapss", version)]
pub struct Options {
    /// Run a client against HOST[:PORT] or coap://HOST[:PORT]/PATH
    #[arg(
        short,
        long,
        value_name = "TARGET",
        num_args = 0..=1,
        default_missing_value = "localhost",
        conflicts_with = "server"
    )]
    pub client: Option<String>,

    /// Run a server answering every request on PORT
    #[arg(short, long, value_name = "PORT", num_args = 0..=1, default_missing_value = "1818")]
    pub server: Option<u16>,

    /// Request method used in client mode
    #[arg(long, value_enum, default_value_t = Method::Get)]
    pub method: Method,

    /// Resource path, overrides the path of the target
    #[arg(long)]
    pub path: Option<String>,

    /// Request payload
    #[arg(long)]
    pub payload: Option<String>,

    /// Send the request non-confirmable
    #[arg(long)]
    pub non: bool,

    /// Initial retransmission timeout
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    pub ack_timeout: Duration,

    /// Retransmissions before giving up
    #[arg(
        long,
        default_value_t = 4,
        value_parser = clap::value_parser!(u32).range(0..=MAX_RETRANSMIT_LIMIT as i64)
    )]
    pub max_retransmit: u32,

    /// Configure app logging levels (off, error, warn, info, debug, trace)
    #[arg(long, value_parser = parse_level, default_value = "info")]
    pub log_level: LevelFilter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl From<Method> for RequestType {
    fn from(method: Method) -> RequestType {
        match method {
            Method::Get => RequestType::Get,
            Method::Post => RequestType::Post,
            Method::Put => RequestType::Put,
            Method::Delete => RequestType::Delete,
        }
    }
}

fn parse_level(level: &str) -> Result<LevelFilter, String> {
    level
        .parse()
        .map_err(|_| format!("unknown log level '{}'", level))
}

impl Options {
    fn params(&self) -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: self.ack_timeout,
            max_retransmit: self.max_retransmit,
            ..TransmissionParameters::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Options::parse();

    let log_config = simplelog::ConfigBuilder::new().build();
    if TermLogger::init(
        opts.log_level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        SimpleLogger::init(opts.log_level, log_config)?;
    }

    if let Some(port) = opts.server {
        run_server(port, opts.params()).await
    } else if let Some(target) = opts.client.as_deref() {
        run_client(target, &opts).await
    } else {
        Options::command().print_help()?;
        Ok(())
    }
}

async fn run_server(port: u16, params: TransmissionParameters) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), params).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    server
        .run(|peer, request| {
            info!(
                "Client {}: {} {} {}",
                peer,
                code_to_str(request.code),
                request.get_path(),
                String::from_utf8_lossy(&request.payload)
            );
            let mut response = CoapMessage::new_response(ResponseType::Content);
            response.set_content_format(ContentFormat::TextPlain);
            response.payload = b"Hello from server".to_vec();
            Some(response)
        })
        .await?;

    Ok(())
}

async fn run_client(target: &str, opts: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let mut target = parse_target(target)?;
    if let Some(path) = &opts.path {
        target.path = path.clone();
    }
    info!("Connecting client to {}:{}", target.host, target.port);

    let mut client = Client::connect(&target, opts.params()).await?;

    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let message_type = if opts.non {
        MessageType::NonConfirmable
    } else {
        MessageType::Confirmable
    };
    let mut request = CoapMessage::new_request(message_type, opts.method.into());
    request.set_path(&target.path);
    if let Some(payload) = &opts.payload {
        request.payload = payload.as_bytes().to_vec();
    }

    let response = client.request(request).await?;
    println!(
        "{} {}",
        code_to_str(response.code),
        String::from_utf8_lossy(&response.payload)
    );

    client.close();
    Ok(())
}
