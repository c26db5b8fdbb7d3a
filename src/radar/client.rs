//! TCP session to the sensor's ASCII monitoring port.
//!
//! One command in flight at a time: the client is owned by the acquisition
//! loop, which serializes calls by construction. Any write or read failure
//! marks the session disconnected; reconnection is the loop's decision on
//! the next poll.

use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on a single telegram; the AUX reply fits comfortably.
const REPLY_BUFFER_SIZE: usize = 4096;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

pub struct RadarClient {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl RadarClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Opens the TCP session. Idempotent while connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = self.addr();
        debug!("connecting to sensor at {addr}");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Connect(format!("timed out connecting to {addr}")))?
            .map_err(|e| Error::Connect(format!("{addr}: {e}")))?;

        info!("connected to sensor at {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    /// Frames `cmd` as `STX cmd ETX`, writes it and reads one bounded reply.
    pub async fn send_command(&mut self, cmd: &str) -> Result<Vec<u8>> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        let stream = self.stream.as_mut().expect("connected above");

        let mut framed = Vec::with_capacity(cmd.len() + 2);
        framed.push(STX);
        framed.extend_from_slice(cmd.as_bytes());
        framed.push(ETX);

        if let Err(e) = stream.write_all(&framed).await {
            self.stream = None;
            return Err(Error::Io(e));
        }

        let mut buffer = vec![0u8; REPLY_BUFFER_SIZE];
        let read = timeout(READ_TIMEOUT, stream.read(&mut buffer)).await;
        let n = match read {
            Ok(Ok(0)) => {
                self.stream = None;
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "sensor closed the connection",
                )));
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(Error::Io(e));
            }
            Err(_) => {
                self.stream = None;
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "timed out waiting for sensor reply",
                )));
            }
        };

        buffer.truncate(n);
        Ok(buffer)
    }

    /// Forgets the session without a close handshake, after an i/o error.
    pub fn mark_disconnected(&mut self) {
        self.stream = None;
    }

    /// Tears the session down. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("sensor connection closed");
        }
    }
}
