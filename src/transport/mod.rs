//! Command Transport
//!
//! The scheduler only needs "receive a named command with arguments" and
//! "send a named event". Delivery, framing and retries belong to whatever
//! sits behind [`CommandTransport`].
//!
//! Two implementations ship:
//! - [`ChannelTransport`]: in-process queue pair, used by tests and embedders
//! - [`LineTransport`]: one command per text line over any async byte stream
//!   (stdin/stdout or a TCP connection to the controller)

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub mod channel;
pub mod line;

pub use channel::{ChannelTransport, ControllerHandle};
pub use line::{pump_lines, LineTransport};

// ============================================================================
// Messages
// ============================================================================

/// A named command as delivered by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl InboundCommand {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split `NAME arg1 arg2 ...` on whitespace. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(Self::new(name, parts))
    }
}

impl fmt::Display for InboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Acknowledgement, completion or status event sent back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub name: String,
    pub args: Vec<String>,
}

impl OutboundEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Append a `key=value` argument.
    #[must_use]
    pub fn field(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.args.push(format!("{key}={value}"));
        self
    }

    pub fn ack(command: &str) -> Self {
        Self::new("ACK").arg(command)
    }

    pub fn nack(command: &str, reason: &str) -> Self {
        Self::new("NACK").arg(command).field("reason", reason)
    }

    /// Value of a `key=value` argument.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|a| {
            a.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

impl fmt::Display for OutboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect to controller at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport closed")]
    Closed,
}

/// Bidirectional command channel between a node and its controller.
///
/// `recv` must be cancel-safe: the scheduler polls it inside `select!`.
#[async_trait]
pub trait CommandTransport: Send {
    /// Next command, or `None` once the controller side is gone.
    async fn recv(&mut self) -> Result<Option<InboundCommand>, TransportError>;

    async fn send(&mut self, event: OutboundEvent) -> Result<(), TransportError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_and_keyed_arguments() {
        let cmd = InboundCommand::parse_line("  CAL delay_ms=7000  mode=LB\n").unwrap();
        assert_eq!(cmd.name, "CAL");
        assert_eq!(cmd.args, vec!["delay_ms=7000", "mode=LB"]);
        assert!(InboundCommand::parse_line("   ").is_none());
        assert_eq!(cmd.to_string(), "CAL delay_ms=7000 mode=LB");
    }

    #[test]
    fn event_line_form() {
        let nack = OutboundEvent::nack("CAL", "late");
        assert_eq!(nack.to_string(), "NACK CAL reason=late");
        assert_eq!(nack.value("reason"), Some("late"));
        assert_eq!(nack.value("missing"), None);

        let done = OutboundEvent::new("tx-done").field("samples", 1000);
        assert_eq!(done.to_string(), "tx-done samples=1000");
    }
}
