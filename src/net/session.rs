//! Per-connection transport session
//!
//! A sans-IO state machine: the socket driver feeds received datagrams into
//! [`Session::receive`], pulls datagrams to send out of [`Session::update`],
//! and drains application payloads with [`Session::poll`]. Time is always
//! passed in, so the whole protocol can be exercised without a socket.
//!
//! Both channels share one packet sequence space, so the ack header on any
//! packet confirms reliable and unreliable traffic alike.
//!
//! - Reliable: messages are split into MTU-sized fragments, each with its
//!   own message id. At most [`RELIABLE_WINDOW`] ids past the oldest unacked
//!   one are in flight. Fragments are resent every `resend_interval` until
//!   the packet carrying them is acked, delivered in id order, and
//!   reassembled before the application sees them.
//! - Unreliable: sent once, bounded outgoing queue dropping the oldest,
//!   delivered in arrival order tagged with the packet sequence.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::game::constants::net::{
    ACK_BITS, MAX_DATAGRAM_SIZE, MAX_FRAGMENTS, MAX_RELIABLE_BACKLOG, MAX_RELIABLE_MESSAGE_SIZE,
    PACKET_HEADER_SIZE, RELIABLE_FRAGMENT_SIZE, RELIABLE_HEADER_SIZE, RELIABLE_WINDOW, RTT_SAMPLES,
    SENT_WINDOW,
};
use crate::game::Tick;
use crate::net::connection::ConnectionId;
use crate::net::framing::{validate_datagram_size, FrameBuilder, FrameReader};
use crate::net::packet::{PacketHeader, PacketKind};
use crate::net::sequence::{sequence_diff, sequence_greater_than, Sequence};

/// Logical channel of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Session tuning, derived from [`crate::config::NetConfig`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence after which the connection is considered dead
    pub timeout: Duration,
    pub resend_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Unreliable payloads queued between two updates
    pub unreliable_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::game::constants::net::DEFAULT_TIMEOUT_MS),
            resend_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(250),
            unreliable_capacity: 64,
        }
    }
}

/// Payload delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub connection: ConnectionId,
    pub channel: Channel,
    /// Sequence of the packet that carried the payload
    pub sequence: Sequence,
    pub payload: Vec<u8>,
}

/// Traffic counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicates_dropped: u64,
    pub unreliable_dropped: u64,
    pub packets_acked: u64,
    pub packets_lost: u64,
    pub reliable_resends: u64,
    /// Reliable messages that needed more than one fragment
    pub reliable_fragmented: u64,
}

#[derive(Debug)]
struct SentPacket {
    sequence: Sequence,
    sent_at: Instant,
    acked: bool,
    reliable_id: Option<u16>,
    tick: Option<Tick>,
}

/// One fragment waiting for its ack; `body` already carries the reliable header
#[derive(Debug)]
struct PendingFragment {
    id: u16,
    message: u64,
    body: Vec<u8>,
    last_sent: Option<Instant>,
}

#[derive(Debug)]
struct OutstandingMessage {
    fragments_left: usize,
    tick: Option<Tick>,
}

#[derive(Debug)]
struct Fragment {
    index: u16,
    count: u16,
    chunk: Vec<u8>,
}

/// Message being rebuilt from in-order fragments
#[derive(Debug)]
struct Reassembly {
    count: u16,
    next_index: u16,
    data: Vec<u8>,
}

#[derive(Debug)]
struct QueuedUnreliable {
    payload: Vec<u8>,
    tick: Option<Tick>,
}

pub struct Session {
    connection: ConnectionId,
    config: SessionConfig,

    // Outgoing packet sequencing
    next_sequence: Sequence,
    /// Sent packets in sequence order, oldest first
    sent: VecDeque<SentPacket>,

    // Incoming packet tracking
    remote_sequence: Option<Sequence>,
    /// Bit i set = packet `remote_sequence - 1 - i` received
    received_bits: u32,

    // Reliable channel
    next_reliable_id: u16,
    next_message: u64,
    /// Unacked fragments in id order
    reliable_out: VecDeque<PendingFragment>,
    outstanding: HashMap<u64, OutstandingMessage>,
    next_expected_id: u16,
    reliable_buffer: HashMap<u16, Fragment>,
    reassembly: Option<Reassembly>,

    // Unreliable channel
    unreliable_out: VecDeque<QueuedUnreliable>,

    inbound: VecDeque<Received>,
    acked_ticks: Vec<Tick>,

    last_received: Instant,
    last_sent: Instant,
    rtt_samples: VecDeque<Duration>,
    rtt: Option<Duration>,
    stats: SessionStats,
}

impl Session {
    pub fn new(connection: ConnectionId, config: SessionConfig, now: Instant) -> Self {
        Self {
            connection,
            config,
            // 0 is what an empty ack header carries; never use it for a real packet
            // before the first wrap
            next_sequence: 1,
            sent: VecDeque::with_capacity(SENT_WINDOW),
            remote_sequence: None,
            received_bits: 0,
            next_reliable_id: 0,
            next_message: 0,
            reliable_out: VecDeque::new(),
            outstanding: HashMap::new(),
            next_expected_id: 0,
            reliable_buffer: HashMap::new(),
            reassembly: None,
            unreliable_out: VecDeque::new(),
            inbound: VecDeque::new(),
            acked_ticks: Vec::new(),
            last_received: now,
            last_sent: now,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLES),
            rtt: None,
            stats: SessionStats::default(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue a payload on a channel; it goes out on the next [`Session::update`]
    ///
    /// Reliable payloads may be up to [`MAX_RELIABLE_MESSAGE_SIZE`] bytes.
    /// Unreliable payloads must fit in one datagram.
    pub fn send(&mut self, channel: Channel, payload: Vec<u8>) -> Result<(), SyncError> {
        match channel {
            Channel::Reliable => self.queue_reliable(&payload, None),
            Channel::Unreliable => self.queue_unreliable(payload, None),
        }
    }

    /// Queue a reliable snapshot; its tick is reported by
    /// [`Session::take_acked_ticks`] once every fragment is acknowledged
    pub fn send_reliable_tagged(&mut self, payload: Vec<u8>, tick: Tick) -> Result<(), SyncError> {
        self.queue_reliable(&payload, Some(tick))
    }

    fn queue_reliable(&mut self, payload: &[u8], tick: Option<Tick>) -> Result<(), SyncError> {
        if payload.len() > MAX_RELIABLE_MESSAGE_SIZE {
            debug!("Refusing reliable message of {} bytes", payload.len());
            return Err(SyncError::malformed(format!(
                "reliable message of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_RELIABLE_MESSAGE_SIZE
            )));
        }

        let count = payload.len().div_ceil(RELIABLE_FRAGMENT_SIZE).max(1);
        if self.reliable_out.len() + count > MAX_RELIABLE_BACKLOG {
            return Err(SyncError::ReliableChannel(format!(
                "{} reliable fragments unacknowledged",
                self.reliable_out.len()
            )));
        }

        let message = self.next_message;
        self.next_message += 1;
        if count > 1 {
            self.stats.reliable_fragmented += 1;
        }

        let mut chunks: Vec<&[u8]> = payload.chunks(RELIABLE_FRAGMENT_SIZE).collect();
        if chunks.is_empty() {
            // An empty payload still takes one fragment
            chunks.push(&[]);
        }
        for (index, chunk) in chunks.into_iter().enumerate() {
            let id = self.next_reliable_id;
            self.next_reliable_id = self.next_reliable_id.wrapping_add(1);
            let body = FrameBuilder::with_capacity(RELIABLE_HEADER_SIZE + chunk.len())
                .write_u16(id)
                .write_u16(index as u16)
                .write_u16(count as u16)
                .write(chunk)
                .build();
            self.reliable_out.push_back(PendingFragment {
                id,
                message,
                body,
                last_sent: None,
            });
        }
        self.outstanding.insert(
            message,
            OutstandingMessage {
                fragments_left: count,
                tick,
            },
        );
        Ok(())
    }

    /// Queue an unreliable snapshot; its tick is reported by
    /// [`Session::take_acked_ticks`] once the peer acknowledges it
    pub fn send_tagged(&mut self, payload: Vec<u8>, tick: Tick) -> Result<(), SyncError> {
        self.queue_unreliable(payload, Some(tick))
    }

    fn queue_unreliable(&mut self, payload: Vec<u8>, tick: Option<Tick>) -> Result<(), SyncError> {
        check_payload_size(payload.len())?;
        if self.unreliable_out.len() >= self.config.unreliable_capacity {
            self.unreliable_out.pop_front();
            self.stats.unreliable_dropped += 1;
        }
        self.unreliable_out.push_back(QueuedUnreliable { payload, tick });
        Ok(())
    }

    /// Produce the datagrams due at `now`
    ///
    /// Sends reliable fragments inside the window that are new or due for a
    /// resend, every queued unreliable payload, and a heartbeat if nothing
    /// went out for a while.
    pub fn update(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();

        let resend_interval = self.config.resend_interval;
        let window_start = self.reliable_out.front().map(|p| p.id).unwrap_or(0);
        let mut due = Vec::new();
        for pending in self.reliable_out.iter_mut() {
            // Ids are ascending, so everything after this is outside the window too
            if pending.id.wrapping_sub(window_start) >= RELIABLE_WINDOW {
                break;
            }
            let is_due = match pending.last_sent {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= resend_interval,
            };
            if is_due {
                if pending.last_sent.is_some() {
                    self.stats.reliable_resends += 1;
                }
                pending.last_sent = Some(now);
                due.push((pending.id, pending.body.clone()));
            }
        }
        for (id, body) in due {
            let datagram = self.build_packet(PacketKind::Reliable, &body, now, Some(id), None);
            datagrams.push(datagram);
        }

        while let Some(queued) = self.unreliable_out.pop_front() {
            let datagram =
                self.build_packet(PacketKind::Unreliable, &queued.payload, now, None, queued.tick);
            datagrams.push(datagram);
        }

        if datagrams.is_empty()
            && now.saturating_duration_since(self.last_sent) >= self.config.heartbeat_interval
        {
            datagrams.push(self.build_packet(PacketKind::Heartbeat, &[], now, None, None));
        }

        datagrams
    }

    fn build_packet(
        &mut self,
        kind: PacketKind,
        body: &[u8],
        now: Instant,
        reliable_id: Option<u16>,
        tick: Option<Tick>,
    ) -> Vec<u8> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let header = PacketHeader {
            kind,
            sequence,
            ack: self.remote_sequence.unwrap_or(0),
            ack_bits: self.received_bits,
        };
        let datagram = header
            .write(FrameBuilder::with_capacity(PACKET_HEADER_SIZE + body.len()))
            .write(body)
            .build();

        if self.sent.len() >= SENT_WINDOW {
            if let Some(oldest) = self.sent.pop_front() {
                if !oldest.acked {
                    self.stats.packets_lost += 1;
                }
            }
        }
        self.sent.push_back(SentPacket {
            sequence,
            sent_at: now,
            acked: false,
            reliable_id,
            tick,
        });

        self.last_sent = now;
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        datagram
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Feed one received datagram into the session
    ///
    /// `MalformedFrame` means the datagram was dropped and the session is
    /// intact. `ReliableChannel` means ordering is broken and the connection
    /// has to be torn down.
    pub fn receive(&mut self, datagram: &[u8], now: Instant) -> Result<(), SyncError> {
        validate_datagram_size(datagram)?;
        let (header, body) = PacketHeader::read(datagram)?;

        self.last_received = now;
        self.stats.datagrams_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        self.process_acks(header.ack, header.ack_bits, now);

        if !self.track_remote(header.sequence) {
            self.stats.duplicates_dropped += 1;
            trace!(
                "Connection {}: dropping duplicate or expired packet {}",
                self.connection,
                header.sequence
            );
            return Ok(());
        }

        match header.kind {
            PacketKind::Heartbeat => {}
            PacketKind::Unreliable => {
                self.inbound.push_back(Received {
                    connection: self.connection,
                    channel: Channel::Unreliable,
                    sequence: header.sequence,
                    payload: body.to_vec(),
                });
            }
            PacketKind::Reliable => self.receive_reliable(header.sequence, body)?,
        }

        Ok(())
    }

    fn receive_reliable(&mut self, sequence: Sequence, body: &[u8]) -> Result<(), SyncError> {
        let mut reader = FrameReader::new(body);
        let (id, index, count) = match (reader.read_u16(), reader.read_u16(), reader.read_u16()) {
            (Some(id), Some(index), Some(count)) => (id, index, count),
            _ => return Err(SyncError::ReliableChannel("truncated reliable header".into())),
        };
        if count == 0 || index >= count || count as usize > MAX_FRAGMENTS {
            return Err(SyncError::ReliableChannel(format!(
                "message {}: fragment {} of {}",
                id, index, count
            )));
        }
        let fragment = Fragment {
            index,
            count,
            chunk: reader.remaining().to_vec(),
        };

        if id == self.next_expected_id {
            self.deliver_fragment(sequence, fragment)?;
            while let Some(buffered) = self.reliable_buffer.remove(&self.next_expected_id) {
                self.deliver_fragment(sequence, buffered)?;
            }
        } else if sequence_greater_than(id, self.next_expected_id) {
            let ahead = sequence_diff(self.next_expected_id, id) as u16;
            if ahead >= RELIABLE_WINDOW {
                return Err(SyncError::ReliableChannel(format!(
                    "message {} too far ahead of {}",
                    id, self.next_expected_id
                )));
            }
            self.reliable_buffer.entry(id).or_insert(fragment);
        } else {
            // Already delivered; the ack for the resend is what the peer needs
            self.stats.duplicates_dropped += 1;
        }
        Ok(())
    }

    /// Append the next in-order fragment, delivering the message once complete
    fn deliver_fragment(&mut self, sequence: Sequence, fragment: Fragment) -> Result<(), SyncError> {
        self.next_expected_id = self.next_expected_id.wrapping_add(1);

        let mut partial = match self.reassembly.take() {
            Some(partial) if partial.count == fragment.count && partial.next_index == fragment.index => {
                partial
            }
            None if fragment.index == 0 => Reassembly {
                count: fragment.count,
                next_index: 0,
                data: Vec::new(),
            },
            _ => {
                return Err(SyncError::ReliableChannel(format!(
                    "fragment {} of {} out of place",
                    fragment.index, fragment.count
                )))
            }
        };

        if partial.data.len() + fragment.chunk.len() > MAX_RELIABLE_MESSAGE_SIZE {
            return Err(SyncError::ReliableChannel(format!(
                "reassembled message exceeds {} bytes",
                MAX_RELIABLE_MESSAGE_SIZE
            )));
        }
        if partial.data.is_empty() {
            partial.data = fragment.chunk;
        } else {
            partial.data.extend_from_slice(&fragment.chunk);
        }
        partial.next_index += 1;

        if partial.next_index == partial.count {
            self.inbound.push_back(Received {
                connection: self.connection,
                channel: Channel::Reliable,
                sequence,
                payload: partial.data,
            });
        } else {
            self.reassembly = Some(partial);
        }
        Ok(())
    }

    /// Record a received packet sequence; false for duplicates and packets
    /// older than the ack window
    fn track_remote(&mut self, sequence: Sequence) -> bool {
        let Some(remote) = self.remote_sequence else {
            self.remote_sequence = Some(sequence);
            self.received_bits = 0;
            return true;
        };

        if sequence_greater_than(sequence, remote) {
            let shift = sequence_diff(remote, sequence) as u32;
            self.received_bits = self
                .received_bits
                .checked_shl(shift)
                .unwrap_or(0)
                | 1u32.checked_shl(shift - 1).unwrap_or(0);
            self.remote_sequence = Some(sequence);
            true
        } else if sequence == remote {
            false
        } else {
            let behind = sequence_diff(sequence, remote) as u32;
            if behind > ACK_BITS as u32 {
                return false;
            }
            let bit = 1u32 << (behind - 1);
            if self.received_bits & bit != 0 {
                return false;
            }
            self.received_bits |= bit;
            true
        }
    }

    fn process_acks(&mut self, ack: Sequence, ack_bits: u32, now: Instant) {
        self.ack_packet(ack, now);
        for i in 0..ACK_BITS {
            if ack_bits & (1 << i) != 0 {
                self.ack_packet(ack.wrapping_sub(i + 1), now);
            }
        }
    }

    fn ack_packet(&mut self, sequence: Sequence, now: Instant) {
        let Some(front) = self.sent.front() else {
            return;
        };
        let index = sequence_diff(front.sequence, sequence);
        if index < 0 || index as usize >= self.sent.len() {
            return;
        }
        let packet = &mut self.sent[index as usize];
        if packet.acked {
            return;
        }
        packet.acked = true;
        self.stats.packets_acked += 1;

        let sample = now.saturating_duration_since(packet.sent_at);
        let reliable_id = packet.reliable_id;
        let tick = packet.tick;

        if let Some(id) = reliable_id {
            self.ack_fragment(id);
        }
        if let Some(tick) = tick {
            self.acked_ticks.push(tick);
        }
        self.update_rtt(sample);
    }

    fn ack_fragment(&mut self, id: u16) {
        let Some(position) = self.reliable_out.iter().position(|p| p.id == id) else {
            // An earlier transmission of the same fragment was acked already
            return;
        };
        let Some(fragment) = self.reliable_out.remove(position) else {
            return;
        };
        let Some(message) = self.outstanding.get_mut(&fragment.message) else {
            return;
        };
        message.fragments_left -= 1;
        if message.fragments_left == 0 {
            if let Some(tick) = message.tick {
                self.acked_ticks.push(tick);
            }
            self.outstanding.remove(&fragment.message);
        }
    }

    fn update_rtt(&mut self, sample: Duration) {
        if self.rtt_samples.len() >= RTT_SAMPLES {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(sample);

        let sum: Duration = self.rtt_samples.iter().sum();
        self.rtt = Some(sum / self.rtt_samples.len() as u32);
    }

    /// Drain every payload received since the last call
    pub fn poll(&mut self) -> impl Iterator<Item = Received> + '_ {
        self.inbound.drain(..)
    }

    /// Ticks of tagged snapshots, on either channel, the peer acknowledged
    /// since the last call
    pub fn take_acked_ticks(&mut self) -> Vec<Tick> {
        std::mem::take(&mut self.acked_ticks)
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) >= self.config.timeout
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received)
    }

    /// Rolling average round-trip time, once at least one ack arrived
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Fraction of resolved packets that left the ack window unacknowledged
    pub fn packet_loss(&self) -> f32 {
        let resolved = self.stats.packets_acked + self.stats.packets_lost;
        if resolved == 0 {
            0.0
        } else {
            self.stats.packets_lost as f32 / resolved as f32
        }
    }

    /// Reliable messages with at least one fragment not yet acknowledged
    pub fn pending_reliable(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether a reliable snapshot sent with [`Session::send_reliable_tagged`]
    /// is still waiting for its ack
    pub fn reliable_snapshot_in_flight(&self) -> bool {
        self.outstanding.values().any(|m| m.tick.is_some())
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

fn check_payload_size(body_len: usize) -> Result<(), SyncError> {
    if PACKET_HEADER_SIZE + body_len > MAX_DATAGRAM_SIZE {
        debug!("Refusing payload of {} bytes", body_len);
        return Err(SyncError::malformed(format!(
            "payload of {} bytes does not fit in a datagram",
            body_len
        )));
    }
    Ok(())
}
