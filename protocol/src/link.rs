//! Link reliability: TX sequence allocation, the RX duplicate /
//! out-of-order filter, the pending-command table with ACK-timeout
//! retries, and the diagnostics counters.
//!
//! The engine is pure state — it never touches the UART or a clock. The
//! caller feeds it `now_ms` and writes out whatever frames it hands back,
//! which lets the controller drive it from its cooperative tick loop and
//! the bridge from a tokio task, both against the same semantics.

use heapless::Vec;
use serde::Serialize;

use crate::frame::{self, FrameBuf, MAX_PAYLOAD};
use crate::message::{Handshake, ResultCode, PROTOCOL_MAJOR, PROTOCOL_MINOR};

/// How long a tracked command waits for its ACK before a retransmit.
pub const ACK_TIMEOUT_MS: u32 = 1_000;
/// Retransmits before a tracked command fails with `TimedOut`.
pub const MAX_RETRIES: u8 = 3;
/// Commands that may await ACKs simultaneously.
pub const MAX_PENDING: usize = 4;

/// Link diagnostics. Counters only ever increase, except through
/// [`LinkStats::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub packets_rx: u32,
    pub packets_tx: u32,
    pub bytes_rx: u32,
    pub bytes_tx: u32,
    pub crc_errors: u32,
    pub framing_errors: u32,
    pub parser_timeouts: u32,
    pub duplicates: u32,
    pub out_of_order: u32,
    pub retries: u32,
    pub ack_timeouts: u32,
    pub nacks_received: u32,
    pub handshake_complete: bool,
    pub negotiated_major: u8,
    pub negotiated_minor: u8,
}

impl LinkStats {
    /// Zero the counters; negotiated-version state survives.
    pub fn reset(&mut self) {
        *self = Self {
            handshake_complete: self.handshake_complete,
            negotiated_major: self.negotiated_major,
            negotiated_minor: self.negotiated_minor,
            ..Self::default()
        };
    }
}

/// Verdict of the RX sequence filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    Accept,
    Duplicate,
    OutOfOrder,
}

/// Terminal state of a tracked command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Acked,
    /// ACK arrived carrying a non-success result code.
    Failed(ResultCode),
    /// Retries exhausted without an ACK.
    TimedOut,
    /// Peer refused with NACK; retry later with backoff.
    Busy,
}

/// What [`LinkEngine::poll_retry`] wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Write these bytes again (identical frame, same seq, so the peer
    /// can deduplicate).
    Retransmit {
        msg_type: u8,
        seq: u8,
        frame: FrameBuf,
    },
    /// Command exhausted its retries.
    GiveUp { msg_type: u8, seq: u8 },
}

#[derive(Debug, Clone)]
struct PendingCommand {
    msg_type: u8,
    seq: u8,
    payload: Vec<u8, MAX_PAYLOAD>,
    first_tx_ms: u32,
    last_tx_ms: u32,
    retries_used: u8,
    deadline_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("pending-command table full")]
    PendingFull,
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
}

/// One side's sequencing/retry state.
pub struct LinkEngine {
    tx_seq: u8,
    last_rx_seq: Option<u8>,
    pending: Vec<PendingCommand, MAX_PENDING>,
    capabilities: u8,
    peer: Option<Handshake>,
    stats: LinkStats,
}

impl LinkEngine {
    pub const fn new() -> Self {
        Self {
            tx_seq: 0,
            last_rx_seq: None,
            pending: Vec::new(),
            capabilities: 0,
            peer: None,
            stats: LinkStats {
                packets_rx: 0,
                packets_tx: 0,
                bytes_rx: 0,
                bytes_tx: 0,
                crc_errors: 0,
                framing_errors: 0,
                parser_timeouts: 0,
                duplicates: 0,
                out_of_order: 0,
                retries: 0,
                ack_timeouts: 0,
                nacks_received: 0,
                handshake_complete: false,
                negotiated_major: 0,
                negotiated_minor: 0,
            },
        }
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut LinkStats {
        &mut self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn alloc_seq(&mut self) -> u8 {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }

    /// Encode a fire-and-forget frame (status, alarms, acks). Counts TX.
    pub fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<FrameBuf, SendError> {
        let seq = self.alloc_seq();
        let frame = frame::encode(msg_type, seq, payload)?;
        self.stats.packets_tx += 1;
        self.stats.bytes_tx += frame.len() as u32;
        Ok(frame)
    }

    /// Encode a command frame and track it until its ACK. Fails when the
    /// pending table is full; callers treat that like a local NACK.
    pub fn send_tracked(
        &mut self,
        msg_type: u8,
        payload: &[u8],
        now_ms: u32,
    ) -> Result<(u8, FrameBuf), SendError> {
        if self.pending.is_full() {
            return Err(SendError::PendingFull);
        }
        let seq = self.alloc_seq();
        let frame = frame::encode(msg_type, seq, payload)?;

        let mut copy = Vec::new();
        let _ = copy.extend_from_slice(payload);
        let _ = self.pending.push(PendingCommand {
            msg_type,
            seq,
            payload: copy,
            first_tx_ms: now_ms,
            last_tx_ms: now_ms,
            retries_used: 0,
            deadline_ms: now_ms.wrapping_add(ACK_TIMEOUT_MS),
        });

        self.stats.packets_tx += 1;
        self.stats.bytes_tx += frame.len() as u32;
        Ok((seq, frame))
    }

    /// Run the RX sequence filter and record an accepted frame.
    pub fn filter_rx_seq(&mut self, seq: u8) -> SeqVerdict {
        let verdict = match self.last_rx_seq {
            None => SeqVerdict::Accept,
            Some(last) if seq == last => SeqVerdict::Duplicate,
            Some(last) if seq < last && last - seq <= 128 => SeqVerdict::OutOfOrder,
            // Numerically greater, or so far behind it must be a wrap.
            Some(_) => SeqVerdict::Accept,
        };
        match verdict {
            SeqVerdict::Accept => self.last_rx_seq = Some(seq),
            SeqVerdict::Duplicate => self.stats.duplicates += 1,
            SeqVerdict::OutOfOrder => self.stats.out_of_order += 1,
        }
        verdict
    }

    /// Count a frame that made it through the parser.
    pub fn record_rx(&mut self, frame_len: usize) {
        self.stats.packets_rx += 1;
        self.stats.bytes_rx += frame_len as u32;
    }

    /// Resolve a pending command against an incoming ACK. Late or
    /// duplicate ACKs match nothing and are ignored.
    pub fn resolve_ack(
        &mut self,
        cmd_type: u8,
        cmd_seq: u8,
        result: ResultCode,
    ) -> Option<CommandOutcome> {
        let at = self
            .pending
            .iter()
            .position(|p| p.msg_type == cmd_type && p.seq == cmd_seq)?;
        self.pending.remove(at);
        Some(if result == ResultCode::Success {
            CommandOutcome::Acked
        } else {
            CommandOutcome::Failed(result)
        })
    }

    /// Resolve a pending command against an incoming NACK: fail fast.
    pub fn resolve_nack(&mut self, cmd_type: u8, cmd_seq: u8) -> Option<CommandOutcome> {
        self.stats.nacks_received += 1;
        let at = self
            .pending
            .iter()
            .position(|p| p.msg_type == cmd_type && p.seq == cmd_seq)?;
        self.pending.remove(at);
        Some(CommandOutcome::Busy)
    }

    /// Check deadlines. Returns at most one action; call until `None`.
    pub fn poll_retry(&mut self, now_ms: u32) -> Option<RetryAction> {
        let at = self
            .pending
            .iter()
            .position(|p| now_ms.wrapping_sub(p.deadline_ms) as i32 >= 0)?;

        if self.pending[at].retries_used < MAX_RETRIES {
            let entry = &mut self.pending[at];
            entry.retries_used += 1;
            entry.last_tx_ms = now_ms;
            entry.deadline_ms = now_ms.wrapping_add(ACK_TIMEOUT_MS);

            // Same seq, same payload: byte-identical retransmit.
            let frame = frame::encode(entry.msg_type, entry.seq, &entry.payload)
                .unwrap_or_else(|_| FrameBuf::new());
            self.stats.retries += 1;
            self.stats.packets_tx += 1;
            self.stats.bytes_tx += frame.len() as u32;
            Some(RetryAction::Retransmit {
                msg_type: entry.msg_type,
                seq: entry.seq,
                frame,
            })
        } else {
            let entry = self.pending.remove(at);
            self.stats.ack_timeouts += 1;
            Some(RetryAction::GiveUp {
                msg_type: entry.msg_type,
                seq: entry.seq,
            })
        }
    }

    /// Capability bits advertised in this side's handshake.
    pub fn set_capabilities(&mut self, capabilities: u8) {
        self.capabilities = capabilities;
    }

    /// The handshake this side advertises.
    pub fn local_handshake(&self) -> Handshake {
        Handshake {
            proto_major: PROTOCOL_MAJOR,
            proto_minor: PROTOCOL_MINOR,
            capabilities: self.capabilities,
            max_packet_size: frame::MAX_FRAME as u16,
        }
    }

    /// Record the peer's handshake; returns the negotiated (field-wise
    /// minimum) version.
    pub fn record_handshake(&mut self, peer: Handshake) -> Handshake {
        let local = self.local_handshake();
        let negotiated = Handshake {
            proto_major: local.proto_major.min(peer.proto_major),
            proto_minor: local.proto_minor.min(peer.proto_minor),
            capabilities: local.capabilities & peer.capabilities,
            max_packet_size: local.max_packet_size.min(peer.max_packet_size),
        };
        self.peer = Some(peer);
        self.stats.handshake_complete = true;
        self.stats.negotiated_major = negotiated.proto_major;
        self.stats.negotiated_minor = negotiated.proto_minor;
        negotiated
    }

    pub fn peer_handshake(&self) -> Option<Handshake> {
        self.peer
    }
}

impl Default for LinkEngine {
    fn default() -> Self {
        Self::new()
    }
}
