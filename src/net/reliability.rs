//! Control-channel reliability layer.
//!
//! Inbound control packets are delivered in strict packet-id order and each
//! accepted packet is acknowledged exactly once; out-of-order arrivals wait
//! in a bounded queue. Outbound control packets are retransmitted with
//! exponential backoff until an inbound ack array covers them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::constants::{MAX_PENDING_CONTROL, RETRANSMIT_INITIAL, RETRANSMIT_MAX};
use crate::protocol::{Opcode, Packet};
use crate::session::Session;

/// An unacknowledged outbound control packet.
struct Outstanding {
    bytes: Vec<u8>,
    next_retry: Instant,
    backoff: Duration,
}

/// Per-session reliability state. All methods are synchronous; wire writes
/// go through the egress channel drained by the transport writer task.
pub struct Reliability {
    session: Arc<Session>,
    egress: mpsc::UnboundedSender<Vec<u8>>,
    delivered: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<BTreeMap<u32, Packet>>,
    outstanding: Mutex<BTreeMap<u32, Outstanding>>,
}

impl Reliability {
    /// Create the layer. The returned receiver yields in-order control
    /// payloads for the TLS stream adapter.
    pub fn new(
        session: Arc<Session>,
        egress: mpsc::UnboundedSender<Vec<u8>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let layer = Arc::new(Self {
            session,
            egress,
            delivered: delivered_tx,
            pending: Mutex::new(BTreeMap::new()),
            outstanding: Mutex::new(BTreeMap::new()),
        });
        (layer, delivered_rx)
    }

    /// Send a control packet, assigning it the next packet id and
    /// registering it for retransmission. Returns the id used.
    pub fn send_control(&self, opcode: Opcode, payload: Bytes) -> Result<u32> {
        let pid = self.session.next_packet_id();
        let packet = Packet::control(opcode, 0, self.session.local_session_id(), pid, payload);
        let bytes = packet.to_bytes().to_vec();

        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                pid,
                Outstanding {
                    bytes: bytes.clone(),
                    next_retry: Instant::now() + RETRANSMIT_INITIAL,
                    backoff: RETRANSMIT_INITIAL,
                },
            );

        self.egress.send(bytes).map_err(|_| Error::ChannelClosed)?;
        trace!("sent control packet id={} opcode={:?}", pid, opcode);
        Ok(pid)
    }

    /// Acknowledge an inbound control packet id.
    pub fn send_ack(&self, pid: u32) -> Result<()> {
        let remote = self
            .session
            .remote_session_id()
            .ok_or_else(|| Error::protocol("cannot ack before remote session id is known"))?;
        let packet = Packet::ack(self.session.local_session_id(), remote, vec![pid]);
        self.egress
            .send(packet.to_bytes().to_vec())
            .map_err(|_| Error::ChannelClosed)?;
        self.session.record_inbound_acked(pid);
        trace!("acked inbound control packet id={}", pid);
        Ok(())
    }

    /// Clear outbound packets covered by an inbound ack array.
    /// Every id in the array is processed.
    pub fn process_acks(&self, packet: &Packet) {
        if packet.acks.is_empty() {
            return;
        }
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        for id in &packet.acks {
            if outstanding.remove(id).is_some() {
                trace!("outbound control packet {} acknowledged", id);
            }
        }
    }

    /// Process one inbound control packet from the demultiplexer.
    pub fn handle_control(&self, packet: Packet) -> Result<()> {
        self.process_acks(&packet);

        // ACKs never advance the inbound counter and are not buffered.
        if packet.is_ack() {
            return Ok(());
        }

        // Soft resets and the key method 1 hard resets must never reach the
        // TLS byte stream; their payload is not control-channel data.
        if packet.opcode.is_unsupported_reset() {
            return Err(Error::protocol(
                "server-initiated soft reset is not supported",
            ));
        }

        let pid = packet
            .packet_id
            .ok_or_else(|| Error::protocol("control packet without packet id"))?;
        let expected = self
            .session
            .last_inbound_acked()
            .map_or(1, |last| last.wrapping_add(1));

        if pid < expected {
            // Our ack may have been lost; re-ack and drop.
            debug!("duplicate control packet id={}, re-acking", pid);
            self.send_ack(pid)?;
            return Ok(());
        }

        if pid > expected {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.len() >= MAX_PENDING_CONTROL && !pending.contains_key(&pid) {
                // The peer will retransmit.
                warn!("out-of-order queue full, dropping control packet id={}", pid);
                return Ok(());
            }
            trace!("buffering out-of-order control packet id={}", pid);
            pending.insert(pid, packet);
            return Ok(());
        }

        self.dispatch(packet, pid)?;

        // Drain now-contiguous packets.
        loop {
            let next = self
                .session
                .last_inbound_acked()
                .map_or(1, |last| last.wrapping_add(1));
            let queued = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&next)
            };
            match queued {
                Some(p) => self.dispatch(p, next)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Hand a packet's payload to the control layer and ack it.
    fn dispatch(&self, packet: Packet, pid: u32) -> Result<()> {
        self.delivered
            .send(packet.payload)
            .map_err(|_| Error::ChannelClosed)?;
        self.send_ack(pid)
    }

    /// Retransmission timer: rewrite unacknowledged control packets with
    /// exponential backoff until the egress channel closes.
    pub async fn run_retransmissions(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
            for (id, entry) in outstanding.iter_mut() {
                if entry.next_retry <= now {
                    if self.egress.send(entry.bytes.clone()).is_err() {
                        return;
                    }
                    debug!("retransmitting control packet id={}", id);
                    entry.backoff = (entry.backoff * 2).min(RETRANSMIT_MAX);
                    entry.next_retry = now + entry.backoff;
                }
            }
        }
    }

    #[cfg(test)]
    fn outstanding_ids(&self) -> Vec<u32> {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn setup() -> (
        Arc<Session>,
        Arc<Reliability>,
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let session = Arc::new(Session::new());
        session
            .set_remote_session_id(SessionId::from_bytes([7; 8]))
            .unwrap();
        // Prime the counter as the hard-reset exchange does.
        session.record_inbound_acked(0);
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let (layer, delivered_rx) = Reliability::new(session.clone(), egress_tx);
        (session, layer, egress_rx, delivered_rx)
    }

    fn control(_session: &Session, pid: u32, payload: &'static [u8]) -> Packet {
        Packet::control(
            Opcode::ControlV1,
            0,
            SessionId::from_bytes([7; 8]),
            pid,
            Bytes::from_static(payload),
        )
    }

    fn drain_acks(egress: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u32> {
        let mut acks = Vec::new();
        while let Ok(bytes) = egress.try_recv() {
            let p = Packet::from_bytes(&bytes).unwrap();
            if p.is_ack() {
                acks.extend(p.acks);
            }
        }
        acks
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let (session, layer, mut egress, mut delivered) = setup();

        layer.handle_control(control(&session, 2, b"two")).unwrap();
        layer.handle_control(control(&session, 1, b"one")).unwrap();
        layer.handle_control(control(&session, 3, b"three")).unwrap();

        assert_eq!(delivered.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(delivered.try_recv().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(delivered.try_recv().unwrap(), Bytes::from_static(b"three"));
        assert!(delivered.try_recv().is_err());

        // Exactly one ack per accepted id, in dispatch order.
        assert_eq!(drain_acks(&mut egress), vec![1, 2, 3]);
        assert_eq!(session.last_inbound_acked(), Some(3));
    }

    #[tokio::test]
    async fn test_duplicate_is_reacked_and_dropped() {
        let (session, layer, mut egress, mut delivered) = setup();

        layer.handle_control(control(&session, 1, b"one")).unwrap();
        layer.handle_control(control(&session, 1, b"one")).unwrap();

        assert_eq!(delivered.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert!(delivered.try_recv().is_err());
        assert_eq!(drain_acks(&mut egress), vec![1, 1]);
        assert_eq!(session.last_inbound_acked(), Some(1));
    }

    #[tokio::test]
    async fn test_soft_reset_is_rejected_not_dispatched() {
        let (session, layer, mut egress, mut delivered) = setup();

        let reset = Packet::control(
            Opcode::ControlSoftResetV1,
            0,
            SessionId::from_bytes([7; 8]),
            1,
            Bytes::from_static(b"rekey material"),
        );
        assert!(matches!(
            layer.handle_control(reset),
            Err(Error::Protocol(_))
        ));
        // Nothing reaches the TLS stream, nothing is acked.
        assert!(delivered.try_recv().is_err());
        assert!(egress.try_recv().is_err());
        assert_eq!(session.last_inbound_acked(), Some(0));
    }

    #[tokio::test]
    async fn test_ack_packets_do_not_advance_inbound() {
        let (session, layer, _egress, mut delivered) = setup();

        let ack = Packet::ack(
            SessionId::from_bytes([7; 8]),
            session.local_session_id(),
            vec![0],
        );
        layer.handle_control(ack).unwrap();

        assert!(delivered.try_recv().is_err());
        assert_eq!(session.last_inbound_acked(), Some(0));
    }

    #[tokio::test]
    async fn test_outbound_cleared_by_ack_array() {
        let (session, layer, mut egress, _delivered) = setup();

        let first = layer
            .send_control(Opcode::ControlV1, Bytes::from_static(b"a"))
            .unwrap();
        let second = layer
            .send_control(Opcode::ControlV1, Bytes::from_static(b"b"))
            .unwrap();
        // Two wire writes happened.
        assert!(egress.try_recv().is_ok());
        assert!(egress.try_recv().is_ok());
        assert_eq!(layer.outstanding_ids(), vec![first, second]);

        // One inbound ACK covering both ids clears both.
        let ack = Packet::ack(
            SessionId::from_bytes([7; 8]),
            session.local_session_id(),
            vec![first, second],
        );
        layer.handle_control(ack).unwrap();
        assert!(layer.outstanding_ids().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_queue_is_bounded() {
        let (session, layer, _egress, mut delivered) = setup();

        // Fill the queue with ids far ahead of the expected one.
        for pid in 0..MAX_PENDING_CONTROL as u32 {
            layer
                .handle_control(control(&session, 10 + pid, b"q"))
                .unwrap();
        }
        // The overflowing newest packet is dropped without error.
        layer
            .handle_control(control(&session, 10_000, b"overflow"))
            .unwrap();
        assert!(delivered.try_recv().is_err());

        // Delivery of the gap still drains the queue that was kept.
        for pid in 1..10 {
            layer.handle_control(control(&session, pid, b"gap")).unwrap();
        }
        let mut count = 0;
        while delivered.try_recv().is_ok() {
            count += 1;
        }
        // 9 gap packets + the 64 buffered ones, the overflow victim is gone.
        assert_eq!(count, 9 + MAX_PENDING_CONTROL);
        assert_eq!(
            session.last_inbound_acked(),
            Some(9 + MAX_PENDING_CONTROL as u32)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_backoff() {
        let (_session, layer, mut egress, _delivered) = setup();

        layer
            .send_control(Opcode::ControlV1, Bytes::from_static(b"retry me"))
            .unwrap();
        let first = egress.try_recv().unwrap();

        let handle = tokio::spawn(layer.clone().run_retransmissions());

        // Nothing resent before the initial 2s backoff.
        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;
        assert!(egress.try_recv().is_err());

        // First retransmission after ~2s.
        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(egress.try_recv().unwrap(), first);

        // Backoff doubled: not yet at +2s, resent by +4s.
        tokio::time::advance(Duration::from_millis(2000)).await;
        tokio::task::yield_now().await;
        assert!(egress.try_recv().is_err());
        tokio::time::advance(Duration::from_millis(2500)).await;
        tokio::task::yield_now().await;
        assert_eq!(egress.try_recv().unwrap(), first);

        handle.abort();
    }
}
