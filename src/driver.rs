//! Async driver for a [`Connection`]
//!
//! One task per connection owns the connection outright. Inbound packets,
//! local commands and timer expiry are all handled on that task, so packet
//! processing never races timer-driven retries or eviction.

use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, FrameSink, IncomingPacket, Transmit};
use crate::error::{MigrationError, Result};
use crate::events::{ConnectionEvent, MigrationHistory};
use crate::path::{PathId, PathKey};
use crate::quic::Frame;

/// Capacity of the command channel
const COMMAND_BUFFER: usize = 256;

enum Command {
    Packet(IncomingPacket),
    Probe {
        local: SocketAddr,
        remote: SocketAddr,
        reply: oneshot::Sender<Result<PathId>>,
    },
    ActivePath(oneshot::Sender<PathKey>),
    History(oneshot::Sender<MigrationHistory>),
    Close {
        error_code: u64,
        reason: String,
    },
}

/// Cloneable handle to a running connection task
#[derive(Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<Command>,
}

impl DriverHandle {
    /// Deliver a decoded packet
    pub async fn packet(&self, packet: IncomingPacket) -> Result<()> {
        self.send(Command::Packet(packet)).await
    }

    /// Start probing `local -> remote`
    pub async fn probe(&self, local: SocketAddr, remote: SocketAddr) -> Result<PathId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Probe { local, remote, reply }).await?;
        rx.await.map_err(|_| MigrationError::ConnectionClosed)?
    }

    pub async fn active_path(&self) -> Result<PathKey> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ActivePath(reply)).await?;
        rx.await.map_err(|_| MigrationError::ConnectionClosed)
    }

    pub async fn history(&self) -> Result<MigrationHistory> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::History(reply)).await?;
        rx.await.map_err(|_| MigrationError::ConnectionClosed)
    }

    pub async fn close(&self, error_code: u64, reason: impl Into<String>) -> Result<()> {
        self.send(Command::Close { error_code, reason: reason.into() }).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| MigrationError::ConnectionClosed)
    }
}

/// [`FrameSink`] forwarding datagrams over a channel, e.g. to a socket task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Transmit>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Transmit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn send_frame(&mut self, path: PathKey, frame: Frame) {
        self.send_datagram(Transmit {
            path,
            destination_cid: None,
            size: frame.encoded_len(),
            frames: vec![frame],
        });
    }

    fn send_datagram(&mut self, transmit: Transmit) {
        if self.tx.send(transmit).is_err() {
            trace!("Transmit receiver dropped");
        }
    }
}

/// Spawn the task driving `connection`.
///
/// Frames go to `sink`, events to `events`. The task ends when the connection
/// closes or every [`DriverHandle`] is dropped.
pub fn spawn<S>(
    connection: Connection,
    sink: S,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> (DriverHandle, JoinHandle<()>)
where
    S: FrameSink + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(run(connection, sink, events, rx));
    (DriverHandle { commands: tx }, task)
}

async fn run<S: FrameSink>(
    mut connection: Connection,
    mut sink: S,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut commands: mpsc::Receiver<Command>,
) {
    loop {
        connection.drain_transmits(&mut sink);
        while let Some(event) = connection.poll_event() {
            let _ = events.send(event);
        }
        if connection.is_closed() {
            debug!("Connection closed, driver exiting");
            break;
        }

        let deadline = connection.poll_timeout();
        let timer = async {
            match deadline {
                Some(deadline) => time::sleep_until(TokioInstant::from_std(deadline)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All handles dropped, driver exiting");
                    break;
                };
                handle_command(&mut connection, command);
            }
            _ = timer => {
                connection.handle_timeout(std::time::Instant::now());
            }
        }
    }
}

fn handle_command(connection: &mut Connection, command: Command) {
    let now = std::time::Instant::now();
    match command {
        Command::Packet(packet) => {
            if let Err(error) = connection.on_packet_received(packet, now) {
                warn!("Packet processing failed: {}", error);
            }
        }
        Command::Probe { local, remote, reply } => {
            let _ = reply.send(connection.probe_path(local, remote, now));
        }
        Command::ActivePath(reply) => {
            let _ = reply.send(connection.active_path());
        }
        Command::History(reply) => {
            let _ = reply.send(connection.history().clone());
        }
        Command::Close { error_code, reason } => connection.close(error_code, &reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::connection::Side;
    use crate::connection_id::ConnectionId;
    use crate::quic::TransportParameters;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn client() -> Connection {
        let config = MigrationConfig {
            initial_rtt_ms: 5,
            min_validation_timeout_ms: 5,
            ..Default::default()
        };
        Connection::new(
            Side::Client,
            config,
            addr("192.0.2.1:5000"),
            addr("10.0.0.1:443"),
            ConnectionId::from_slice(&[1; 8]).unwrap(),
            ConnectionId::from_slice(&[2; 8]).unwrap(),
            TransportParameters::default(),
            std::time::Instant::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_driver_reports_handshake_and_active_path() {
        let (sink, mut transmits) = ChannelSink::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, task) = spawn(client(), sink, events_tx);

        assert_eq!(handle.active_path().await.unwrap(), PathKey::new(addr("192.0.2.1:5000"), addr("10.0.0.1:443")));
        assert!(matches!(events.recv().await, Some(ConnectionEvent::HandshakeCompleted { .. })));
        // NEW_CONNECTION_ID for the peer
        assert!(transmits.recv().await.is_some());

        handle.close(0, "bye").await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_without_spare_connection_id_fails() {
        let (sink, _transmits) = ChannelSink::new();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (handle, task) = spawn(client(), sink, events_tx);

        let result = handle.probe(addr("198.51.100.2:5000"), addr("10.0.0.1:443")).await;
        assert!(matches!(result, Err(MigrationError::NoPeerConnectionId)));
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_probe_fails_validation() {
        let (sink, mut transmits) = ChannelSink::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, task) = spawn(client(), sink, events_tx);

        let server_cid = IncomingPacket::new(
            addr("192.0.2.1:5000"),
            addr("10.0.0.1:443"),
            ConnectionId::from_slice(&[1; 8]).unwrap(),
            1,
            vec![Frame::NewConnectionId {
                sequence_number: 1,
                retire_prior_to: 0,
                connection_id: ConnectionId::from_slice(&[3; 8]).unwrap(),
                stateless_reset_token: crate::connection_id::StatelessResetToken::new([3; 16]),
            }],
        );
        handle.packet(server_cid).await.unwrap();

        let wifi = addr("192.0.2.1:5000");
        let cellular = addr("198.51.100.2:5000");
        let path = handle.probe(cellular, addr("10.0.0.1:443")).await.unwrap();
        assert_eq!(path, PathId(1));

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ConnectionEvent::ValidationFailed { path, attempts }) => break (path, attempts),
                    Some(_) => continue,
                    None => panic!("driver stopped"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed.0.local, cellular);
        assert_eq!(failed.1, 3);
        assert_eq!(handle.active_path().await.unwrap().local, wifi);

        let mut challenges = 0;
        while let Ok(transmit) = transmits.try_recv() {
            if transmit.frames.iter().any(|frame| matches!(frame, Frame::PathChallenge { .. })) {
                challenges += 1;
            }
        }
        assert_eq!(challenges, 3);

        handle.close(0, "done").await.unwrap();
        task.await.unwrap();
    }
}
