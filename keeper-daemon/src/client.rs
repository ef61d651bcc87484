//! Blocking client for the daemon socket.
//!
//! Used by the CLI (`status`, `stop`) and by the liveness probe, neither of
//! which runs inside a tokio runtime.

use std::net::TcpStream;
use std::time::Duration;

use keeper_core::{PossessionKey, ServiceId};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::paths::endpoint;
use crate::protocol::{
    decode, encode, read_frame, write_frame, DaemonRequest, DaemonResponse, HandshakeMessage,
    Hello, MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE,
};

pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Connects to the daemon endpoint on `port`. `timeout` bounds the
    /// connect and every subsequent read and write.
    pub fn connect(port: u16, timeout: Duration) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect_timeout(&endpoint(port), timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }

    /// Presents `key`. On rejection the server closes the connection, so a
    /// failed client is spent.
    pub fn authenticate(&mut self, key: &str) -> Result<String, ProtocolError> {
        let hello = HandshakeMessage::Hello(Hello::new(key));
        write_frame(&mut self.stream, &encode(&hello)?)?;
        let reply = read_frame(&mut self.stream, MAX_HANDSHAKE_FRAME_SIZE)?;
        match decode::<HandshakeMessage>(&reply)? {
            HandshakeMessage::HelloAck(ack) => Ok(ack.server_info),
            HandshakeMessage::HelloNack(nack) => {
                tracing::debug!(reason = %nack.reason, "daemon rejected handshake");
                Err(ProtocolError::AuthenticationFailed)
            }
            HandshakeMessage::Hello(_) => Err(ProtocolError::Malformed(
                "daemon answered hello with hello".to_string(),
            )),
        }
    }

    pub fn request(&mut self, request: &DaemonRequest) -> Result<Value, ProtocolError> {
        write_frame(&mut self.stream, &encode(request)?)?;
        let reply = read_frame(&mut self.stream, MAX_FRAME_SIZE)?;
        decode::<DaemonResponse>(&reply)?.into_data()
    }

    /// Binds this connection to `service`. Afterwards only
    /// [`send_frame`](Self::send_frame) and [`recv_frame`](Self::recv_frame)
    /// make sense.
    pub fn open(&mut self, service: ServiceId) -> Result<(), ProtocolError> {
        self.request(&DaemonRequest::Open {
            service: service.as_str().to_string(),
        })
        .map(|_| ())
    }

    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, payload)
    }

    pub fn recv_frame(&mut self) -> Result<Vec<u8>, ProtocolError> {
        read_frame(&mut self.stream, MAX_FRAME_SIZE)
    }
}

pub fn connect_authenticated(
    port: u16,
    key: &str,
    timeout: Duration,
) -> Result<Client, ProtocolError> {
    let mut client = Client::connect(port, timeout)?;
    client.authenticate(key)?;
    Ok(client)
}

/// True when a daemon answers on `port` and accepts `key`.
pub fn ping(port: u16, key: &PossessionKey, timeout: Duration) -> bool {
    let result = connect_authenticated(port, key.as_str(), timeout)
        .and_then(|mut client| client.request(&DaemonRequest::Ping));
    match result {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(port, error = %err, "ping failed");
            false
        }
    }
}

pub fn request_status(port: u16, key: &str, timeout: Duration) -> Result<Value, ProtocolError> {
    connect_authenticated(port, key, timeout)?.request(&DaemonRequest::Status)
}

pub fn request_stop(port: u16, key: &str, timeout: Duration) -> Result<Value, ProtocolError> {
    connect_authenticated(port, key, timeout)?.request(&DaemonRequest::Shutdown)
}
