//! The Session Engine (§4.3–§4.6): an actor owning one [`SessionState`] and
//! serializing every inbound frame, outbound send, and timer expiry through
//! a single mailbox. `Session` is the cheap, cloneable handle callers hold;
//! the actual `Engine` never leaves its task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{DataFrame, HeaderFlags};
use crate::config::SessionConfig;
use crate::error::{BtpError, BtpFlowError, BtpProtocolError, Result};
use crate::state::SessionState;
use crate::timer::{TimerId, TimerService};

/// The transport/application side of a session, collapsed into one trait
/// per the design note preferring a single callback interface over three
/// separate closures.
#[async_trait]
pub trait SessionCallbacks: Send + Sync {
    /// Write a frame to the BLE transport (a GATT characteristic write).
    async fn write(&self, bytes: &[u8]) -> anyhow::Result<()>;
    /// Tear down the underlying BLE connection. Called at most once.
    async fn disconnect(&self);
    /// Hand a fully reassembled Matter message to the application layer.
    async fn deliver(&self, message: Vec<u8>);
}

enum EngineEvent {
    Inbound(Vec<u8>, oneshot::Sender<Result<()>>),
    SendMessage(Vec<u8>, oneshot::Sender<Result<()>>),
    TimerFired(TimerId),
    Close(oneshot::Sender<()>),
}

/// A running BTP session. Cloning shares the same underlying engine task;
/// dropping the last clone lets the task's mailbox drain and exit.
#[derive(Clone)]
pub struct Session {
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Session {
    /// Spawns the engine task and returns a handle to it. `timer_events`
    /// must be the receiving half of whatever channel `timers` was built
    /// with; the caller wires the `TimerService` impl, the engine only
    /// consumes the `TimerId`s it reports.
    ///
    /// [`crate::handshake::create_from_handshake_request`] is the normal
    /// way to obtain a `Session`; this is exposed directly for callers
    /// (and tests) driving an already-negotiated `SessionState`.
    pub fn spawn(
        state: SessionState,
        callbacks: Box<dyn SessionCallbacks>,
        timers: Arc<dyn TimerService>,
        timer_events: mpsc::UnboundedReceiver<TimerId>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward_timer_events(timer_events, events_tx.clone()));

        let engine = Engine {
            state,
            callbacks,
            timers,
            config,
        };
        tokio::spawn(engine.run(events_rx));

        Session { events: events_tx }
    }

    /// Feeds one inbound frame (as received from the BLE transport) into
    /// the session. Resolves the full §4.3 ordered check sequence before
    /// returning.
    pub async fn handle_incoming_ble_data(&self, bytes: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.events.send(EngineEvent::Inbound(bytes, tx)).is_err() {
            return Err(BtpProtocolError::SessionClosed.into());
        }
        rx.await.map_err(|_| BtpProtocolError::SessionClosed.into())?
    }

    /// Queues a Matter message for segmentation and transmission, driving
    /// the send queue as far as the current window allows.
    pub async fn send_matter_message(&self, bytes: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(EngineEvent::SendMessage(bytes, tx))
            .is_err()
        {
            return Err(BtpProtocolError::SessionClosed.into());
        }
        rx.await.map_err(|_| BtpProtocolError::SessionClosed.into())?
    }

    /// Idempotently tears the session down: stops both timers and invokes
    /// `disconnect` at most once.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(EngineEvent::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn forward_timer_events(
    mut timer_events: mpsc::UnboundedReceiver<TimerId>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    while let Some(id) = timer_events.recv().await {
        if events.send(EngineEvent::TimerFired(id)).is_err() {
            break;
        }
    }
}

struct Engine {
    state: SessionState,
    callbacks: Box<dyn SessionCallbacks>,
    timers: Arc<dyn TimerService>,
    config: SessionConfig,
}

impl Engine {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Inbound(bytes, respond) => {
                    let result = self.ingest(bytes).await;
                    let _ = respond.send(result);
                }
                EngineEvent::SendMessage(bytes, respond) => {
                    let result = self.enqueue_and_send(bytes).await;
                    let _ = respond.send(result);
                }
                EngineEvent::TimerFired(id) => {
                    self.on_timer_fired(id).await;
                }
                EngineEvent::Close(respond) => {
                    self.close().await;
                    let _ = respond.send(());
                }
            }
        }
    }

    // ---- Inbound path (§4.3) --------------------------------------

    async fn ingest(&mut self, bytes: Vec<u8>) -> Result<()> {
        if !self.state.is_active {
            return Err(BtpProtocolError::SessionClosed.into());
        }

        let max_tolerated = self.state.fragment_size + 3;
        if bytes.len() > max_tolerated {
            let err = BtpProtocolError::OversizedFrame {
                len: bytes.len(),
                max: max_tolerated,
            };
            self.close_with_error(&err).await;
            return Err(err.into());
        }
        if bytes.len() > self.state.fragment_size {
            log::debug!(
                "accepting a {}-byte frame above the negotiated fragmentSize of {} bytes",
                bytes.len(),
                self.state.fragment_size
            );
        }

        let frame = match DataFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                let err = BtpProtocolError::from(err);
                self.close_with_error(&err).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.apply_inbound_frame(frame).await {
            self.close_with_error(&err).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn apply_inbound_frame(&mut self, frame: DataFrame) -> Result<(), BtpProtocolError> {
        // check #1
        if frame.flags.is_control() {
            return Err(BtpProtocolError::UnexpectedControlFrame);
        }
        // check #2
        if frame.payload.is_empty() && !frame.has_ack() {
            return Err(BtpProtocolError::EmptyFrame);
        }
        // check #3
        let expected = self.state.prev_incoming_sequence_number.wrapping_add(1);
        if frame.sequence_number != expected {
            return Err(BtpProtocolError::SequenceGap {
                expected,
                got: frame.sequence_number,
            });
        }
        self.state.prev_incoming_sequence_number = frame.sequence_number;

        // check #4: any inbound frame means we now owe an ack eventually.
        if !self.state.send_ack_timer_running {
            self.timers.start(TimerId::SendAck, self.config.send_ack_timeout);
            self.state.send_ack_timer_running = true;
        }

        // check #5
        if let Some(ack) = frame.ack_number {
            self.apply_ack(ack)?;
        }

        // check #6
        self.apply_reassembly(&frame).await?;

        Ok(())
    }

    fn apply_ack(&mut self, ack: u8) -> Result<(), BtpProtocolError> {
        let prev_ack = self.state.prev_incoming_ack_number;
        let outgoing_seq = self.state.sequence_number;

        let dist_to_ack = crate::state::serial_distance(prev_ack, ack);
        let dist_to_seq = crate::state::serial_distance(prev_ack, outgoing_seq);
        if dist_to_ack == 0 || dist_to_ack > dist_to_seq {
            return Err(BtpProtocolError::InvalidAck {
                ack,
                prev_ack,
                outgoing_seq,
            });
        }

        self.timers.stop(TimerId::AckReceive);
        self.state.ack_receive_timer_running = false;
        self.state.prev_incoming_ack_number = ack;

        if crate::state::serial_distance(ack, outgoing_seq) > 0 {
            self.timers.start(TimerId::AckReceive, self.config.ack_timeout);
            self.state.ack_receive_timer_running = true;
        }
        Ok(())
    }

    /// Standalone ack-only frames (no payload, not `isBegin`, not `isEnd`)
    /// carry no reassembly-relevant data and are a no-op here; everything
    /// else must either start or continue a reassembly.
    async fn apply_reassembly(&mut self, frame: &DataFrame) -> Result<(), BtpProtocolError> {
        if frame.is_begin() {
            if self.state.reassembly.is_some() {
                return Err(BtpProtocolError::ReassemblyAlreadyInProgress);
            }
            let expected_length = frame.message_length.unwrap_or(0) as usize;
            let mut reassembly =
                crate::state::ReassemblyBuffer::begin(expected_length, &frame.payload)?;
            if frame.is_end() {
                if !reassembly.is_complete() {
                    return Err(BtpProtocolError::MessageLengthMismatch {
                        expected: reassembly.expected_length(),
                        actual: reassembly.len(),
                    });
                }
                log::debug!("delivering {}-byte single-segment message", reassembly.len());
                self.callbacks.deliver(reassembly.into_inner()).await;
            } else {
                self.state.reassembly = Some(reassembly);
            }
            return Ok(());
        }

        if frame.payload.is_empty() && !frame.is_end() {
            return Ok(());
        }

        let reassembly = self
            .state
            .reassembly
            .as_mut()
            .ok_or(BtpProtocolError::NoReassemblyInProgress)?;
        reassembly.append(&frame.payload)?;

        if frame.is_end() {
            if !reassembly.is_complete() {
                return Err(BtpProtocolError::MessageLengthMismatch {
                    expected: reassembly.expected_length(),
                    actual: reassembly.len(),
                });
            }
            let message = self.state.reassembly.take().unwrap().into_inner();
            log::debug!("delivering {}-byte reassembled message", message.len());
            self.callbacks.deliver(message).await;
        }
        Ok(())
    }

    // ---- Outbound path (§4.4) --------------------------------------

    async fn enqueue_and_send(&mut self, bytes: Vec<u8>) -> Result<()> {
        if !self.state.is_active {
            return Err(BtpProtocolError::SessionClosed.into());
        }
        if bytes.is_empty() {
            return Err(BtpFlowError::EmptyMessage.into());
        }
        self.state
            .outbound_queue
            .push_back(crate::state::OutboundMessage::new(bytes));
        self.drive_send_queue().await
    }

    async fn drive_send_queue(&mut self) -> Result<()> {
        if self.state.send_in_progress {
            return Ok(());
        }
        self.state.send_in_progress = true;
        let result = self.send_until_window_closed().await;
        self.state.send_in_progress = false;
        result
    }

    async fn send_until_window_closed(&mut self) -> Result<()> {
        while !self.state.outbound_queue.is_empty() && self.state.window_open() {
            let piggyback = self.state.ack_owed();
            if piggyback {
                self.state.prev_acked_sequence_number = self.state.prev_incoming_sequence_number;
                self.timers.stop(TimerId::SendAck);
                self.state.send_ack_timer_running = false;
            }

            let (is_begin, is_end, segment, message_length_for_begin) = {
                let msg = self.state.outbound_queue.front_mut().unwrap();
                let remaining = msg.remaining();
                let is_begin = remaining == msg.total_len();
                let header_len = 1
                    + if piggyback { 1 } else { 0 }
                    + 1
                    + if is_begin { 2 } else { 0 };
                let segment_cap = self.state.fragment_size.saturating_sub(header_len);
                let is_end = remaining <= segment_cap;
                let message_length_for_begin = is_begin.then_some(remaining as u16);
                let segment = msg.take(segment_cap).to_vec();
                (is_begin, is_end, segment, message_length_for_begin)
            };

            let mut flags = HeaderFlags::empty();
            if is_begin {
                flags |= HeaderFlags::IS_BEGIN;
            }
            if is_end {
                flags |= HeaderFlags::IS_END;
            }
            if piggyback {
                flags |= HeaderFlags::HAS_ACK;
            }

            let seq = self.state.next_seq();
            let frame = DataFrame {
                flags,
                ack_number: piggyback.then_some(self.state.prev_acked_sequence_number),
                sequence_number: seq,
                message_length: message_length_for_begin,
                payload: segment,
            };

            let wire = frame.encode().map_err(BtpProtocolError::from)?;
            if let Err(err) = self.callbacks.write(&wire).await {
                log::warn!("transport write failed: {err}");
                return Err(BtpError::Transport(err));
            }

            if !self.state.ack_receive_timer_running {
                self.timers.start(TimerId::AckReceive, self.config.ack_timeout);
                self.state.ack_receive_timer_running = true;
            }

            if is_end {
                self.state.outbound_queue.pop_front();
            }
        }
        Ok(())
    }

    // ---- Timers (§4.5) ----------------------------------------------

    async fn on_timer_fired(&mut self, id: TimerId) {
        if !self.state.is_active {
            return;
        }
        match id {
            TimerId::AckReceive => {
                self.state.ack_receive_timer_running = false;
                if self.state.prev_incoming_ack_number != self.state.sequence_number {
                    let err = BtpProtocolError::AckTimeout;
                    self.close_with_error(&err).await;
                }
            }
            TimerId::SendAck => {
                self.state.send_ack_timer_running = false;
                if self.state.ack_owed() {
                    self.send_standalone_ack().await;
                }
            }
        }
    }

    /// Every frame placed on the wire, including a bare ack, must continue
    /// the unbroken seq+1 chain the peer's check #3 expects, so this
    /// claims a fresh sequence number rather than repeating the last one.
    async fn send_standalone_ack(&mut self) {
        let ack = self.state.prev_incoming_sequence_number;
        self.state.prev_acked_sequence_number = ack;
        let seq = self.state.next_seq();

        let frame = DataFrame {
            flags: HeaderFlags::HAS_ACK,
            ack_number: Some(ack),
            sequence_number: seq,
            message_length: None,
            payload: vec![],
        };
        let wire = match frame.encode() {
            Ok(wire) => wire,
            Err(err) => {
                log::warn!("failed to encode standalone ack: {err}");
                return;
            }
        };
        if self.callbacks.write(&wire).await.is_err() {
            log::warn!("standalone ack write failed");
            return;
        }
        if !self.state.ack_receive_timer_running {
            self.timers.start(TimerId::AckReceive, self.config.ack_timeout);
            self.state.ack_receive_timer_running = true;
        }
    }

    // ---- Teardown (§4.6) ---------------------------------------------

    async fn close_with_error(&mut self, err: &BtpProtocolError) {
        log::warn!("closing session: {err}");
        self.close().await;
    }

    async fn close(&mut self) {
        if !self.state.is_active {
            return;
        }
        self.state.is_active = false;
        self.timers.stop(TimerId::AckReceive);
        self.timers.stop(TimerId::SendAck);
        self.state.ack_receive_timer_running = false;
        self.state.send_ack_timer_running = false;
        self.callbacks.disconnect().await;
    }
}
