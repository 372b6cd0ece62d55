//! Line-oriented transport.
//!
//! One command per line, `NAME arg1 key=value ...`; events go out in the
//! same form. Works over stdin/stdout or a TCP connection to the controller.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults;

use super::{CommandTransport, ControllerHandle, InboundCommand, OutboundEvent, TransportError};

pub struct LineTransport<R, W> {
    reader: BufReader<R>,
    /// Bytes of the line being read; survives a cancelled `recv`.
    pending: Vec<u8>,
    /// Skipping the rest of an over-long line.
    discarding: bool,
    writer: W,
    name: String,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, name: impl Into<String>) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            discarding: false,
            writer,
            name: name.into(),
        }
    }
}

impl LineTransport<tokio::io::Stdin, tokio::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }
}

impl LineTransport<OwnedReadHalf, OwnedWriteHalf> {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        info!(addr, "[Transport] Connected to controller");
        Ok(Self::new(reader, writer, format!("tcp://{addr}")))
    }
}

#[async_trait]
impl<R, W> CommandTransport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<InboundCommand>, TransportError> {
        loop {
            // `read_until` is cancel-safe: partial reads stay in `pending`
            let room = (defaults::MAX_COMMAND_LINE_BYTES + 1).saturating_sub(self.pending.len());
            let read = (&mut self.reader)
                .take(room as u64)
                .read_until(b'\n', &mut self.pending)
                .await?;

            let complete = self.pending.last() == Some(&b'\n');
            if read == 0 && !complete {
                if self.pending.is_empty() || self.discarding {
                    return Ok(None);
                }
            } else if !complete {
                if self.pending.len() > defaults::MAX_COMMAND_LINE_BYTES {
                    if !self.discarding {
                        warn!(
                            transport = %self.name,
                            max_bytes = defaults::MAX_COMMAND_LINE_BYTES,
                            "[Transport] Dropping over-long line"
                        );
                    }
                    self.pending.clear();
                    self.discarding = true;
                }
                continue;
            }

            let bytes = std::mem::take(&mut self.pending);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            match String::from_utf8(bytes) {
                Ok(line) => {
                    if let Some(command) = InboundCommand::parse_line(&line) {
                        return Ok(Some(command));
                    }
                }
                Err(e) => {
                    warn!(
                        transport = %self.name,
                        bytes = e.as_bytes().len(),
                        "[Transport] Dropping line that is not valid UTF-8"
                    );
                }
            }
        }
    }

    async fn send(&mut self, event: OutboundEvent) -> Result<(), TransportError> {
        self.writer
            .write_all(format!("{event}\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shuttle commands and events between `transport` and the node's queue pair.
///
/// Returns when the controller closes the stream, the node side goes away or
/// `cancel` fires.
pub async fn pump_lines<T>(
    mut transport: T,
    mut node: ControllerHandle,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    T: CommandTransport,
{
    info!(transport = transport.name(), "[Transport] Pump started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = transport.recv() => match command? {
                Some(command) => {
                    debug!(%command, "[Transport] Command received");
                    node.send(command).await?;
                }
                None => {
                    info!(transport = transport.name(), "[Transport] Controller closed the stream");
                    break;
                }
            },
            event = node.recv_event() => match event {
                Some(event) => transport.send(event).await?,
                None => break,
            },
        }
    }
    Ok(())
}
