//! Device protocol session.
//!
//! A [`DgLabSession`] terminates the wire protocol for one device link:
//!
//! ```text
//!   connect ──► unbound ──(bind reply "DGLAB")──► bound ──► closed
//!                  │                                ▲
//!                  └──(20s without reply)── break "211" ──► closed
//! ```
//!
//! Once bound the session acknowledges the bind, clears both channel queues
//! and starts a heartbeat. Everything observed from the device is published
//! as [`SessionEvent`]s on a broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use coyote_core::protocol::{head, ret_code, Command, DeviceMessage, Envelope, MessageType};
use coyote_core::{Channel, FeedbackButton, ProtocolError, PulseFrame, StrengthInfo, StrengthOp};

use crate::task::TaskError;
use crate::transport::{Link, TransportError, TransportEvent, TransportHandle};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by a device session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Device did not bind in time
    #[error("Bind timeout after {0:?}")]
    BindTimeout(Duration),

    /// Traffic attempted before the device bound
    #[error("Session is not bound to a device")]
    NotBound,

    /// Session already closed
    #[error("Session closed")]
    Closed,

    /// Requested strength exceeds the device-reported limit
    #[error("Strength {strength} out of limit {limit} on channel {channel}")]
    StrengthOutOfLimit {
        /// Target channel
        channel: Channel,
        /// Requested strength
        strength: u32,
        /// Last reported limit
        limit: u32,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol encoding failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

impl From<SessionError> for TaskError {
    fn from(err: SessionError) -> Self {
        TaskError::failed(err)
    }
}

// ============================================================================
// Configuration and Events
// ============================================================================

/// Session timing.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Poll period while waiting for the bind reply
    pub bind_poll_interval: Duration,
    /// Give up binding after this long
    pub bind_timeout: Duration,
    /// Pause after the post-bind reset
    pub settle_delay: Duration,
    /// Heartbeat period once bound
    pub heartbeat_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_poll_interval: Duration::from_millis(500),
            bind_timeout: Duration::from_secs(20),
            settle_delay: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(20),
            event_capacity: 64,
        }
    }
}

/// Events published by a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Device reported new strengths
    StrengthChanged {
        /// Channel A
        a: StrengthInfo,
        /// Channel B
        b: StrengthInfo,
    },
    /// A strength command was sent
    SetStrength {
        /// Target channel
        channel: Channel,
        /// Requested strength
        strength: u32,
    },
    /// Pulse frames were sent
    SendPulse {
        /// Target channel
        channel: Channel,
        /// Frames sent
        frames: Vec<PulseFrame>,
    },
    /// A channel queue was cleared
    ClearPulse {
        /// Target channel
        channel: Channel,
    },
    /// Device-side button press
    Feedback(FeedbackButton),
    /// The link is gone; emitted exactly once
    Close,
}

// ============================================================================
// Session
// ============================================================================

/// Protocol session for one device link.
pub struct DgLabSession {
    client_id: String,
    target_id: OnceLock<String>,
    transport: TransportHandle,
    config: SessionConfig,
    strength: Mutex<[StrengthInfo; 2]>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DgLabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DgLabSession")
            .field("client_id", &self.client_id)
            .field("target_id", &self.target_id.get())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl DgLabSession {
    /// Run the bind handshake over `link` and return the bound session.
    ///
    /// A random client id is generated when `client_id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::BindTimeout`] after sending a server-delay
    /// break and closing the link, or [`SessionError::Closed`] if the link
    /// dropped during the handshake.
    pub async fn connect(
        link: Link,
        client_id: Option<String>,
        config: SessionConfig,
    ) -> SessionResult<Arc<Self>> {
        let Link { handle, events } = link;
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let session = Arc::new(Self {
            client_id: client_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            target_id: OnceLock::new(),
            transport: handle,
            config,
            strength: Mutex::new([StrengthInfo::default(); 2]),
            events: event_tx,
            closed: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        });

        tokio::spawn(Self::read_loop(Arc::clone(&session), events));

        session.bind().await?;
        session.reset().await?;
        tokio::time::sleep(session.config.settle_delay).await;
        session.start_heartbeat();

        Ok(session)
    }

    async fn bind(&self) -> SessionResult<()> {
        self.send(MessageType::Bind, head::TARGET_ID).await?;

        let started = Instant::now();
        while self.target_id.get().is_none() {
            tokio::time::sleep(self.config.bind_poll_interval).await;

            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            if started.elapsed() > self.config.bind_timeout {
                tracing::warn!("Bind timeout for client {}", self.client_id);
                if let Err(e) = self.send(MessageType::Break, ret_code::SERVER_DELAY).await {
                    tracing::warn!("Failed to send bind timeout notice: {}", e);
                }
                self.transport.close().await;
                self.finish();
                return Err(SessionError::BindTimeout(self.config.bind_timeout));
            }
        }

        Ok(())
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if session.is_closed() {
                    break;
                }
                if let Err(e) = session.send(MessageType::Heartbeat, ret_code::SUCCESS).await {
                    tracing::warn!("Heartbeat to {} failed: {}", session.client_id, e);
                }
            }
        });

        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn read_loop(session: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(frame) => session.handle_frame(&frame),
                TransportEvent::Closed => break,
            }
        }
        session.finish();
    }

    fn handle_frame(self: &Arc<Self>, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Invalid frame from {}: {} ({})", self.client_id, frame, e);
                return;
            }
        };

        match envelope.kind {
            MessageType::Bind => self.handle_bind(envelope),
            MessageType::Msg => {
                if self.target_id.get().is_none() {
                    tracing::warn!(
                        "Rejected unbound message on {}: {}",
                        self.client_id,
                        envelope.message
                    );
                    return;
                }
                self.handle_msg(&envelope.message);
            }
            MessageType::Heartbeat => {
                if envelope.message != head::DG_LAB {
                    tracing::debug!("Heartbeat reply on {}: {}", self.client_id, envelope.message);
                }
            }
            MessageType::Break => {
                if envelope.message == ret_code::CLIENT_DISCONNECTED {
                    tracing::info!("Device disconnected: {}", envelope.target_id);
                } else {
                    tracing::info!("Break on {}: {}", self.client_id, envelope.message);
                }
            }
            MessageType::Error => {
                tracing::warn!("Device error on {}: {}", self.client_id, envelope.message);
            }
        }
    }

    fn handle_bind(self: &Arc<Self>, envelope: Envelope) {
        if envelope.message != head::DG_LAB {
            tracing::warn!("Bind failed on {}: {}", self.client_id, envelope.message);
            return;
        }
        if !envelope.client_id.is_empty() && envelope.client_id != self.client_id {
            tracing::warn!(
                "Rejected bind for foreign client id {} on {}",
                envelope.client_id,
                self.client_id
            );
            return;
        }
        if self.target_id.set(envelope.target_id).is_err() {
            tracing::debug!("Ignoring repeated bind on {}", self.client_id);
            return;
        }

        tracing::info!(
            "Bind success: {} -> {}",
            self.client_id,
            self.target_id().unwrap_or_default()
        );

        // The reader must keep draining the link while the ack is written.
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.send(MessageType::Bind, ret_code::SUCCESS).await {
                tracing::warn!("Failed to acknowledge bind on {}: {}", session.client_id, e);
            }
        });
    }

    fn handle_msg(&self, payload: &str) {
        match DeviceMessage::parse(payload) {
            Ok(DeviceMessage::Strength { a, b }) => {
                *self.strength.lock().unwrap_or_else(PoisonError::into_inner) = [a, b];
                tracing::debug!(
                    "Strength on {}: A {}/{}, B {}/{}",
                    self.client_id,
                    a.strength,
                    a.limit,
                    b.strength,
                    b.limit
                );
                let _ = self.events.send(SessionEvent::StrengthChanged { a, b });
            }
            Ok(DeviceMessage::Feedback(button)) => {
                let _ = self.events.send(SessionEvent::Feedback(button));
            }
            Ok(DeviceMessage::Other(other)) => {
                tracing::debug!("Unhandled message on {}: {}", self.client_id, other);
            }
            Err(e) => {
                tracing::warn!("Rejected message on {}: {}", self.client_id, e);
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Session-local identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Device identity, fixed once bound.
    #[must_use]
    pub fn target_id(&self) -> Option<&str> {
        self.target_id.get().map(String::as_str)
    }

    /// Last reported state of `channel`.
    #[must_use]
    pub fn strength(&self, channel: Channel) -> StrengthInfo {
        let strength = self.strength.lock().unwrap_or_else(PoisonError::into_inner);
        match channel {
            Channel::A => strength[0],
            Channel::B => strength[1],
        }
    }

    /// Whether the link is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Set the absolute output strength of `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StrengthOutOfLimit`] when `strength` exceeds
    /// the last reported limit of the channel, or the transport failure.
    pub async fn set_strength(&self, channel: Channel, strength: u32) -> SessionResult<()> {
        let limit = self.strength(channel).limit;
        if strength > limit {
            return Err(SessionError::StrengthOutOfLimit { channel, strength, limit });
        }

        self.send_command(&Command::Strength {
            channel,
            op: StrengthOp::SetTo,
            value: strength,
        })
        .await?;

        let _ = self.events.send(SessionEvent::SetStrength { channel, strength });
        Ok(())
    }

    /// Append frames to the device's playback queue of `channel`.
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    pub async fn send_pulse(&self, channel: Channel, frames: &[PulseFrame]) -> SessionResult<()> {
        self.send_command(&Command::Pulse {
            channel,
            frames: frames.to_vec(),
        })
        .await?;

        let _ = self.events.send(SessionEvent::SendPulse {
            channel,
            frames: frames.to_vec(),
        });
        Ok(())
    }

    /// Flush the device's playback queue of `channel`.
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    pub async fn clear_pulse(&self, channel: Channel) -> SessionResult<()> {
        self.send_command(&Command::Clear { channel }).await?;

        let _ = self.events.send(SessionEvent::ClearPulse { channel });
        Ok(())
    }

    /// Clear both channel queues.
    ///
    /// # Errors
    ///
    /// Returns the first transport failure.
    pub async fn reset(&self) -> SessionResult<()> {
        for channel in Channel::ALL {
            self.clear_pulse(channel).await?;
        }
        Ok(())
    }

    /// Send a disconnect notice and close the link.
    ///
    /// A failing notice is logged; the link is closed regardless.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.send(MessageType::Break, ret_code::CLIENT_DISCONNECTED).await {
            tracing::warn!("Failed to send break message on {}: {}", self.client_id, e);
        }
        self.transport.close().await;
        self.finish();
    }

    /// Send a raw envelope, for notices outside the `msg` sub-protocol.
    ///
    /// # Errors
    ///
    /// Returns the encoding or transport failure. A transport failure also
    /// closes the link.
    pub async fn send(&self, kind: MessageType, message: &str) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let target_id = self.target_id().unwrap_or_default();
        let frame = Envelope::new(kind, self.client_id.as_str(), target_id, message).encode()?;

        if kind != MessageType::Heartbeat {
            tracing::debug!("Send to {}: {}", self.client_id, frame);
        }

        if let Err(e) = self.transport.send(frame).await {
            tracing::error!("Failed to send message on {}: {}", self.client_id, e);
            self.transport.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_command(&self, command: &Command) -> SessionResult<()> {
        if self.target_id.get().is_none() {
            return Err(SessionError::NotBound);
        }
        self.send(MessageType::Msg, &command.to_string()).await
    }

    fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let heartbeat = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        tracing::info!("Session closed: {}", self.client_id);
        let _ = self.events.send(SessionEvent::Close);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connect_pair, FakeDevice};
    use crate::transport::{memory_pair, TransportConfig};

    #[tokio::test(start_paused = true)]
    async fn test_bind_handshake() {
        let (session, mut device) = connect_pair(Some("dev1")).await;

        assert_eq!(session.client_id(), "dev1");
        assert_eq!(session.target_id(), Some(device.target_id.as_str()));

        // the handshake finishes with a reset of both channels
        assert_eq!(device.recv_msg().await, "clear-1");
        assert_eq!(device.recv_msg().await, "clear-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_timeout_sends_server_delay() {
        let (link, peer) = memory_pair(TransportConfig::default());
        let mut device = FakeDevice::new(peer);

        let connect = tokio::spawn(DgLabSession::connect(
            link,
            Some("c".to_string()),
            SessionConfig::default(),
        ));

        let request = device.recv_envelope().await.unwrap();
        assert_eq!(request.kind, MessageType::Bind);
        assert_eq!(request.message, head::TARGET_ID);

        let notice = device.recv_envelope().await.unwrap();
        assert_eq!(notice.kind, MessageType::Break);
        assert_eq!(notice.message, ret_code::SERVER_DELAY);

        assert!(matches!(connect.await.unwrap(), Err(SessionError::BindTimeout(_))));
        assert!(device.recv_envelope().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_for_other_client_is_ignored() {
        let (link, peer) = memory_pair(TransportConfig {
            idle_timeout: None,
            ..TransportConfig::default()
        });
        let mut device = FakeDevice::new(peer);

        let connect = tokio::spawn(DgLabSession::connect(
            link,
            Some("mine".to_string()),
            SessionConfig::default(),
        ));

        device.recv_envelope().await.unwrap();
        device.send_envelope(MessageType::Bind, "someone-else", "t1", head::DG_LAB).await;

        let notice = device.recv_envelope().await.unwrap();
        assert_eq!(notice.kind, MessageType::Break);
        assert!(connect.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_before_bind_are_rejected() {
        let (link, peer) = memory_pair(TransportConfig {
            idle_timeout: None,
            ..TransportConfig::default()
        });
        let mut device = FakeDevice::new(peer);

        let connect = tokio::spawn(DgLabSession::connect(
            link,
            Some("c".to_string()),
            SessionConfig::default(),
        ));

        device.recv_envelope().await.unwrap();
        device.report_strength(5, 5, 50, 50).await;
        device.reply_bind("c").await;

        let session = connect.await.unwrap().unwrap();
        assert_eq!(session.strength(Channel::A), StrengthInfo::default());
        assert_eq!(session.strength(Channel::B), StrengthInfo::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_strength_limit_enforced() {
        let (session, mut device) = connect_pair(Some("dev1")).await;
        device.drain_reset().await;
        let mut events = session.subscribe();

        device.report_strength(0, 0, 20, 10).await;
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StrengthChanged {
                a: StrengthInfo {
                    strength: 0,
                    limit: 20,
                },
                b: StrengthInfo {
                    strength: 0,
                    limit: 10,
                },
            }
        );

        let err = session.set_strength(Channel::A, 25).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::StrengthOutOfLimit {
                channel: Channel::A,
                strength: 25,
                limit: 20,
            }
        ));

        session.set_strength(Channel::A, 15).await.unwrap();
        assert_eq!(device.recv_msg().await, "strength-1+2+15");
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SetStrength {
                channel: Channel::A,
                strength: 15,
            }
        );

        assert!(session.set_strength(Channel::B, 11).await.is_err());
        assert!(session.set_strength(Channel::B, 10).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_and_clear_commands() {
        let (session, mut device) = connect_pair(None).await;
        device.drain_reset().await;

        let frames = [PulseFrame::from_hex("0A0A0A0A64646464").unwrap()];
        session.send_pulse(Channel::B, &frames).await.unwrap();
        assert_eq!(device.recv_msg().await, r#"pulse-B:["0A0A0A0A64646464"]"#);

        session.clear_pulse(Channel::A).await.unwrap();
        assert_eq!(device.recv_msg().await, "clear-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_event() {
        let (session, mut device) = connect_pair(None).await;
        let mut events = session.subscribe();

        device.send_msg("feedback-6").await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Feedback(FeedbackButton::B2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_sent() {
        let (_session, mut device) = connect_pair(None).await;
        device.drain_reset().await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        let heartbeat = device.recv_envelope().await.unwrap();
        assert_eq!(heartbeat.kind, MessageType::Heartbeat);
        assert_eq!(heartbeat.message, ret_code::SUCCESS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_break_and_emits_once() {
        let (session, mut device) = connect_pair(None).await;
        device.drain_reset().await;
        let mut events = session.subscribe();

        session.close().await;
        session.close().await;

        let notice = device.recv_envelope().await.unwrap();
        assert_eq!(notice.kind, MessageType::Break);
        assert_eq!(notice.message, ret_code::CLIENT_DISCONNECTED);

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Close);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        assert!(matches!(session.clear_pulse(Channel::A).await, Err(SessionError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_emits_close() {
        let (session, device) = connect_pair(None).await;
        let mut events = session.subscribe();

        device.disconnect().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Close);
        assert!(session.is_closed());
    }
}
