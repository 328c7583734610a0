//! TCP channel transport.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The first frame in each direction is a [`Hello`] naming the channel's
//! purpose and describing the sending realm. Everything after that is an
//! envelope.

use super::{port_with_link, ChannelHandle, Port};
use crate::config::{MessagingConfig, TransportConfig};
use crate::realm::SenderDescriptor;
use crate::{MessengerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Preamble frame exchanged by both sides before any envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    pub sender: SenderDescriptor,
}

impl Hello {
    pub fn new(name: impl Into<String>, sender: SenderDescriptor) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(MessengerError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(MessengerError::FrameTooLarge {
            size: payload.len(),
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Open a channel to a listening realm.
///
/// The returned port's name is the purpose declared in `hello`.
pub async fn connect(addr: SocketAddr, hello: Hello) -> Result<Port> {
    let mut stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| MessengerError::HandshakeTimeout(TransportConfig::CONNECT_TIMEOUT))??;

    let peer = exchange_hello(&mut stream, &hello).await?;
    debug!("TCP channel to {} ({:?})", addr, peer.sender.kind);
    Ok(spawn_link(stream, &hello.name, peer.sender))
}

/// Turn an accepted connection into a channel.
///
/// The returned port's name is the purpose the *peer* declared, so the
/// connection manager can validate it.
///
/// The remote [`SenderDescriptor`] is whatever the peer put in its `Hello`.
/// Nothing on a local socket proves it, so a listener must decide which
/// declared kinds it accepts before handing the port to
/// [`Realm::accept`](crate::realm::Realm::accept).
pub async fn accept(mut stream: TcpStream, hello: Hello) -> Result<Port> {
    let peer = exchange_hello(&mut stream, &hello).await?;
    Ok(spawn_link(stream, &peer.name, peer.sender))
}

async fn exchange_hello(stream: &mut TcpStream, local: &Hello) -> Result<Hello> {
    let bytes = serde_json::to_vec(local)?;
    write_frame(stream, &bytes).await?;

    let frame = tokio::time::timeout(MessagingConfig::HANDSHAKE_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| MessengerError::HandshakeTimeout(MessagingConfig::HANDSHAKE_TIMEOUT))??
        .ok_or_else(|| MessengerError::ConnectionRefused {
            reason: "peer closed during handshake".to_string(),
        })?;

    serde_json::from_slice(&frame).map_err(|e| MessengerError::MalformedEnvelope {
        message: format!("invalid hello frame: {}", e),
    })
}

fn spawn_link(stream: TcpStream, name: &str, remote: SenderDescriptor) -> Port {
    let (port, link) = port_with_link(name, remote);
    let (reader, writer) = stream.into_split();

    tokio::spawn(read_loop(reader, link.inbound, port.handle.clone()));
    tokio::spawn(write_loop(writer, link.outbound, port.handle.clone()));

    port
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Value>,
    handle: ChannelHandle,
) {
    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = handle.closed() => break,
        };

        match frame {
            Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    if inbound.send(value).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(channel = %handle.id(), "dropping non-JSON frame: {}", e),
            },
            Ok(None) => {
                debug!(channel = %handle.id(), "peer closed TCP channel");
                break;
            }
            Err(e) => {
                debug!(channel = %handle.id(), "TCP channel read failed: {}", e);
                break;
            }
        }
    }
    handle.close();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    handle: ChannelHandle,
) {
    loop {
        let value = tokio::select! {
            biased;
            value = outbound.recv() => match value {
                Some(value) => value,
                None => break,
            },
            _ = handle.closed() => break,
        };

        let written = match serde_json::to_vec(&value) {
            Ok(bytes) => write_frame(&mut writer, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            debug!(channel = %handle.id(), "TCP channel write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    handle.close();
}
