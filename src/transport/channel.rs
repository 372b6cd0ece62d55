//! In-process transport.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{CommandTransport, InboundCommand, OutboundEvent, TransportError};

/// Node side of an in-process queue pair.
pub struct ChannelTransport {
    commands: mpsc::Receiver<InboundCommand>,
    events: mpsc::Sender<OutboundEvent>,
}

/// Controller side: inject commands, observe events.
pub struct ControllerHandle {
    commands: mpsc::Sender<InboundCommand>,
    events: mpsc::Receiver<OutboundEvent>,
}

impl ChannelTransport {
    pub fn pair(capacity: usize) -> (Self, ControllerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (evt_tx, evt_rx) = mpsc::channel(capacity);
        (
            Self {
                commands: cmd_rx,
                events: evt_tx,
            },
            ControllerHandle {
                commands: cmd_tx,
                events: evt_rx,
            },
        )
    }
}

#[async_trait]
impl CommandTransport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<InboundCommand>, TransportError> {
        Ok(self.commands.recv().await)
    }

    async fn send(&mut self, event: OutboundEvent) -> Result<(), TransportError> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

impl ControllerHandle {
    pub async fn send(&self, command: InboundCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send a command given in line form. Blank lines are ignored.
    pub async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        match InboundCommand::parse_line(line) {
            Some(command) => self.send(command).await,
            None => Ok(()),
        }
    }

    /// Next event, `None` on timeout or once the node side is gone.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<OutboundEvent> {
        tokio::time::timeout(timeout, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next event without a deadline.
    pub async fn recv_event(&mut self) -> Option<OutboundEvent> {
        self.events.recv().await
    }

    /// Skip events until one named `name` arrives.
    pub async fn wait_for(&mut self, name: &str, timeout: Duration) -> Option<OutboundEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_event(remaining).await?;
            if event.name == name {
                return Some(event);
            }
        }
    }

    pub fn try_next_event(&mut self) -> Option<OutboundEvent> {
        self.events.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_and_events_cross_the_pair() {
        let (mut node, mut controller) = ChannelTransport::pair(4);
        controller.send_line("SYNC abc").await.unwrap();
        controller.send_line("").await.unwrap();

        let cmd = node.recv().await.unwrap().unwrap();
        assert_eq!(cmd, InboundCommand::new("SYNC", ["abc"]));

        node.send(OutboundEvent::ack("SYNC")).await.unwrap();
        node.send(OutboundEvent::new("synced")).await.unwrap();
        let event = controller
            .wait_for("synced", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(event.name, "synced");
        assert!(controller.try_next_event().is_none());

        drop(controller);
        assert!(node.recv().await.unwrap().is_none());
        assert!(matches!(
            node.send(OutboundEvent::new("x")).await,
            Err(TransportError::Closed)
        ));
    }
}
