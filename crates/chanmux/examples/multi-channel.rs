//! Multi-channel example: concurrent typed request/reply exchanges, one per
//! channel, over a single TCP connection.
//!
//! Run with:
//!   cargo run --example multi-channel --features logging
//!
//! Set `CHANMUX_LOG=debug` to watch channels open and close.

use std::error::Error;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use chanmux::conn::{ConnectionConfig, Context};
use chanmux::logging::{init_logging, LogFormat, LogLevel};
use chanmux::protocol::{Message, Protocol, ProtocolError};
use tokio::net::{TcpListener, TcpStream};

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Greeting,
    Echo,
}

#[derive(Debug)]
enum Msg {
    Greeting(String),
    Echo(String),
}

impl Message for Msg {
    type Kind = Kind;

    fn kind(&self) -> Kind {
        match self {
            Msg::Greeting(_) => Kind::Greeting,
            Msg::Echo(_) => Kind::Echo,
        }
    }

    fn write_body(&self, dst: &mut dyn Write) -> io::Result<usize> {
        let (Msg::Greeting(text) | Msg::Echo(text)) = self;
        let len = u16::try_from(text.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "text too long"))?;
        dst.write_all(&len.to_be_bytes())?;
        dst.write_all(text.as_bytes())?;
        Ok(2 + text.len())
    }
}

fn read_text(src: &mut dyn Read) -> io::Result<String> {
    let mut len = [0u8; 2];
    src.read_exact(&mut len)?;
    let mut text = vec![0u8; u16::from_be_bytes(len) as usize];
    src.read_exact(&mut text)?;
    String::from_utf8(text).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

fn read_greeting(src: &mut dyn Read) -> io::Result<Msg> {
    read_text(src).map(Msg::Greeting)
}

fn read_echo(src: &mut dyn Read) -> io::Result<Msg> {
    read_text(src).map(Msg::Echo)
}

fn protocol() -> Result<Protocol<Msg>, ProtocolError> {
    let mut builder = Protocol::builder(1);
    builder
        .register(Kind::Greeting, 1, read_greeting)?
        .register(Kind::Echo, 2, read_echo)?;
    Ok(builder.build())
}

const NAMES: [&str; 3] = ["alpha", "beta", "gamma"];

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let level = std::env::var("CHANMUX_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LogLevel::Info);
    init_logging(LogFormat::Text, level);

    let protocol = Arc::new(protocol()?);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server_ctx = Context::new(ConnectionConfig::default())?;
    let server = tokio::spawn({
        let ctx = server_ctx.clone();
        let protocol = Arc::clone(&protocol);
        async move {
            let (stream, peer) = listener.accept().await?;
            let conn = ctx.attach(peer.to_string(), stream)?;

            let mut handlers = Vec::new();
            for _ in NAMES {
                let channel = conn.accept().await?;
                let protocol = Arc::clone(&protocol);
                handlers.push(tokio::spawn(async move {
                    let request = protocol.decode_from_slice(&channel.read_to_end().await?)?;
                    let Msg::Greeting(name) = request else {
                        return Err::<(), BoxError>("expected a greeting".into());
                    };
                    eprintln!("[server] channel {} <- {name}", channel.id());
                    let reply = protocol.encode_to_bytes(&Msg::Echo(format!("hello, {name}")))?;
                    channel.write_final(&reply).await?;
                    Ok(())
                }));
            }
            for handler in handlers {
                handler.await??;
            }
            Ok::<_, BoxError>(())
        }
    });

    let client_ctx = Context::new(ConnectionConfig::default())?;
    let conn = client_ctx.attach(addr.to_string(), TcpStream::connect(addr).await?)?;

    let mut calls = Vec::new();
    for name in NAMES {
        let channel = conn.open_channel()?;
        let protocol = Arc::clone(&protocol);
        calls.push(tokio::spawn(async move {
            let request = protocol.encode_to_bytes(&Msg::Greeting(name.to_string()))?;
            channel.write_final(&request).await?;
            let reply = protocol.decode_from_slice(&channel.read_to_end().await?)?;
            eprintln!("[client] channel {} -> {reply:?}", channel.id());
            Ok::<_, BoxError>(())
        }));
    }
    for call in calls {
        call.await??;
    }
    server.await??;

    eprintln!("[client] {:?}", conn.stats());
    client_ctx.shutdown().await;
    server_ctx.shutdown().await;
    Ok(())
}
