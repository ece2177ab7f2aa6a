//! The reliable-link task.
//!
//! One task owns the serial writer, the sequencing/retry engine, and the
//! NACK backoff clock; a byte-stream reader feeds the shared parser
//! inside the same task via `select!`. Applications talk to it through
//! [`LinkHandle`] (commands with completion) and an event channel
//! (decoded telemetry), the same reader → channel → processor topology
//! the rest of the service uses.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use brewos_protocol::frame::FrameBuf;
use brewos_protocol::link::{CommandOutcome, LinkEngine, LinkStats, RetryAction, SendError, SeqVerdict};
use brewos_protocol::message::{
    Ack, Alarm, Boot, ConfigSnapshot, EnvConfig, Handshake, Message, MsgType, PowerMeter,
    ResultCode, Status,
};
use brewos_protocol::parser::{Event, Parser};

/// Command dispatch interval after a NACK; doubles per NACK up to the cap.
pub const BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Decoded traffic from the controller.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Status(Status),
    Alarm(Alarm),
    Boot(Boot),
    Config(ConfigSnapshot),
    EnvConfig(EnvConfig),
    PowerMeter(PowerMeter),
    HandshakeComplete {
        peer: Handshake,
        negotiated: Handshake,
    },
    Ping {
        timestamp_ms: u32,
    },
}

pub struct CommandRequest {
    message: Message,
    done: oneshot::Sender<CommandOutcome>,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("link task is gone")]
    Closed,
}

/// Cloneable command entry point.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<CommandRequest>,
}

impl LinkHandle {
    /// Send a command and wait for its terminal outcome (ACK, failure
    /// code, retry exhaustion, or NACK busy).
    pub async fn command(&self, message: Message) -> Result<CommandOutcome, LinkError> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(CommandRequest { message, done })
            .await
            .map_err(|_| LinkError::Closed)?;
        outcome.await.map_err(|_| LinkError::Closed)
    }
}

/// A running link: handle, event stream, diagnostics, and the task.
pub struct Link {
    pub handle: LinkHandle,
    pub events: mpsc::Receiver<LinkEvent>,
    pub stats: watch::Receiver<LinkStats>,
    pub task: JoinHandle<Result<(), LinkError>>,
}

impl Link {
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (stats_tx, stats_rx) = watch::channel(LinkStats::default());
        let task = tokio::spawn(run_link(reader, writer, cmd_rx, event_tx, stats_tx));
        Self {
            handle: LinkHandle { commands: cmd_tx },
            events: event_rx,
            stats: stats_rx,
            task,
        }
    }
}

struct Backoff {
    interval: Duration,
    next_send: Instant,
}

impl Backoff {
    fn new() -> Self {
        Self {
            interval: BACKOFF_BASE,
            next_send: Instant::now(),
        }
    }

    fn ready(&self) -> bool {
        Instant::now() >= self.next_send
    }

    /// Peer said busy: double the dispatch interval and hold off.
    fn bump(&mut self) {
        self.interval = (self.interval * 2).min(BACKOFF_CAP);
        self.next_send = Instant::now() + self.interval;
    }

    fn reset(&mut self) {
        self.interval = BACKOFF_BASE;
        self.next_send = Instant::now();
    }
}

/// The link task body. Public so tests can drive it over an in-memory
/// duplex without the spawn wrapper.
pub async fn run_link<R, W>(
    mut reader: R,
    mut writer: W,
    mut commands: mpsc::Receiver<CommandRequest>,
    events: mpsc::Sender<LinkEvent>,
    stats: watch::Sender<LinkStats>,
) -> Result<(), LinkError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut engine = LinkEngine::new();
    let mut parser = Parser::new();
    let mut in_flight: Vec<((u8, u8), oneshot::Sender<CommandOutcome>)> = Vec::new();
    let mut backoff = Backoff::new();
    let mut buf = [0u8; 256];

    // Version exchange opens the link.
    let handshake = Message::Handshake(engine.local_handshake());
    let frame = engine
        .send(MsgType::Handshake as u8, &handshake.encode_payload())
        .expect("handshake payload fits a frame");
    writer.write_all(&frame).await?;
    writer.flush().await?;
    info!("link up, handshake sent");

    let mut housekeeping = time::interval(Duration::from_millis(50));
    loop {
        let now_ms = started.elapsed().as_millis() as u32;
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    warn!("peer closed the link");
                    return Ok(());
                }
                for &byte in &buf[..n] {
                    let Some(event) = parser.push(byte, now_ms) else { continue };
                    let reply = handle_parser_event(
                        event,
                        &mut engine,
                        &mut in_flight,
                        &mut backoff,
                        &events,
                    )
                    .await;
                    if let Some(reply) = reply {
                        writer.write_all(&reply).await?;
                        writer.flush().await?;
                    }
                }
            }

            request = commands.recv(), if backoff.ready() => {
                let Some(request) = request else {
                    debug!("command channel closed, link task exiting");
                    return Ok(());
                };
                let payload = request.message.encode_payload();
                let msg_type = request.message.msg_type() as u8;
                match engine.send_tracked(msg_type, &payload, now_ms) {
                    Ok((seq, frame)) => {
                        writer.write_all(&frame).await?;
                        writer.flush().await?;
                        in_flight.push(((msg_type, seq), request.done));
                    }
                    Err(SendError::PendingFull) => {
                        let _ = request.done.send(CommandOutcome::Busy);
                    }
                    Err(error) => {
                        warn!(%error, "failed to frame command");
                        let _ = request
                            .done
                            .send(CommandOutcome::Failed(ResultCode::Failed));
                    }
                }
            }

            _ = housekeeping.tick() => {
                if let Some(Event::Timeout) = parser.check_timeout(now_ms) {
                    engine.stats_mut().parser_timeouts += 1;
                }
                while let Some(action) = engine.poll_retry(now_ms) {
                    match action {
                        RetryAction::Retransmit { msg_type, seq, frame } => {
                            debug!(msg_type, seq, "retransmitting command");
                            writer.write_all(&frame).await?;
                            writer.flush().await?;
                        }
                        RetryAction::GiveUp { msg_type, seq } => {
                            warn!(msg_type, seq, "command timed out");
                            resolve(&mut in_flight, msg_type, seq, CommandOutcome::TimedOut);
                        }
                    }
                }
            }
        }
        let _ = stats.send(*engine.stats());
    }
}

/// Handle one parser event; a returned frame must be written back to
/// the peer (currently only the ACK answering an inbound PING).
async fn handle_parser_event(
    event: Event,
    engine: &mut LinkEngine,
    in_flight: &mut Vec<((u8, u8), oneshot::Sender<CommandOutcome>)>,
    backoff: &mut Backoff,
    events: &mpsc::Sender<LinkEvent>,
) -> Option<FrameBuf> {
    let frame = match event {
        Event::Frame(frame) => frame,
        Event::CrcError => {
            engine.stats_mut().crc_errors += 1;
            return None;
        }
        Event::FramingError => {
            engine.stats_mut().framing_errors += 1;
            return None;
        }
        Event::Timeout => {
            engine.stats_mut().parser_timeouts += 1;
            return None;
        }
    };

    engine.record_rx(frame.payload.len() + 6);
    match engine.filter_rx_seq(frame.seq) {
        SeqVerdict::Accept => {}
        SeqVerdict::Duplicate | SeqVerdict::OutOfOrder => return None,
    }

    let message = match Message::decode(frame.msg_type, &frame.payload) {
        Ok(message) => message,
        Err(error) => {
            warn!(msg_type = frame.msg_type, %error, "undecodable frame");
            return None;
        }
    };

    let mut reply = None;
    let event = match message {
        Message::Ack(ack) => {
            if let Some(outcome) = engine.resolve_ack(ack.cmd_type, ack.cmd_seq, ack.result) {
                backoff.reset();
                resolve(in_flight, ack.cmd_type, ack.cmd_seq, outcome);
            }
            return None;
        }
        Message::Nack(nack) => {
            if let Some(outcome) = engine.resolve_nack(nack.cmd_type, nack.cmd_seq) {
                backoff.bump();
                resolve(in_flight, nack.cmd_type, nack.cmd_seq, outcome);
            }
            return None;
        }
        Message::Handshake(peer) => {
            let negotiated = engine.record_handshake(peer);
            info!(
                peer_major = peer.proto_major,
                peer_minor = peer.proto_minor,
                negotiated_major = negotiated.proto_major,
                negotiated_minor = negotiated.proto_minor,
                "handshake complete"
            );
            LinkEvent::HandshakeComplete { peer, negotiated }
        }
        Message::Status(status) => LinkEvent::Status(status),
        Message::Alarm(alarm) => LinkEvent::Alarm(alarm),
        Message::Boot(boot) => LinkEvent::Boot(boot),
        Message::Config(config) => LinkEvent::Config(config),
        Message::EnvConfig(env) => LinkEvent::EnvConfig(env),
        Message::PowerMeter(power) => LinkEvent::PowerMeter(power),
        Message::Ping(ping) => {
            // The controller pings after 5 s of RX silence; answering is
            // what lets it clear COMM_TIMEOUT on a healthy link.
            let ack = Message::Ack(Ack {
                cmd_type: MsgType::Ping as u8,
                cmd_seq: frame.seq,
                result: ResultCode::Success,
            });
            reply = engine.send(MsgType::Ack as u8, &ack.encode_payload()).ok();
            LinkEvent::Ping {
                timestamp_ms: ping.timestamp_ms,
            }
        }
        other => {
            warn!(msg_type = other.msg_type() as u8, "unexpected message direction");
            return None;
        }
    };

    if events.send(event).await.is_err() {
        debug!("event channel closed");
    }
    reply
}

fn resolve(
    in_flight: &mut Vec<((u8, u8), oneshot::Sender<CommandOutcome>)>,
    msg_type: u8,
    seq: u8,
    outcome: CommandOutcome,
) {
    if let Some(at) = in_flight.iter().position(|(key, _)| *key == (msg_type, seq)) {
        let (_, done) = in_flight.swap_remove(at);
        let _ = done.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new();
        assert!(backoff.ready());

        backoff.bump();
        assert_eq!(backoff.interval, Duration::from_millis(500));
        assert!(!backoff.ready());

        for _ in 0..10 {
            backoff.bump();
        }
        assert_eq!(backoff.interval, BACKOFF_CAP);

        backoff.reset();
        assert_eq!(backoff.interval, BACKOFF_BASE);
        assert!(backoff.ready());
    }
}
