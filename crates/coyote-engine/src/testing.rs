//! In-memory device used by the engine's tests.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use coyote_core::protocol::{head, ret_code, Envelope, MessageType};

use crate::session::{DgLabSession, SessionConfig};
use crate::transport::{memory_pair, RemotePeer, TransportConfig};

/// Device side of an in-memory link, driven step by step from a test.
pub struct FakeDevice {
    peer: RemotePeer,
    pub target_id: String,
    pub client_id: String,
}

impl FakeDevice {
    pub fn new(peer: RemotePeer) -> Self {
        Self {
            peer,
            target_id: "device-1".to_string(),
            client_id: String::new(),
        }
    }

    /// Next envelope from the session, `None` once the link closed.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let line = self.peer.recv().await.unwrap()?;
        Some(Envelope::decode(&line).unwrap())
    }

    /// Announce `client_id` ahead of the handshake.
    pub async fn send_hello(&mut self, client_id: &str) {
        self.peer.send(client_id).await.unwrap();
    }

    pub async fn send_envelope(
        &mut self,
        kind: MessageType,
        client_id: &str,
        target_id: &str,
        message: &str,
    ) {
        let frame = Envelope::new(kind, client_id, target_id, message).encode().unwrap();
        self.peer.send(&frame).await.unwrap();
    }

    pub async fn reply_bind(&mut self, client_id: &str) {
        let target_id = self.target_id.clone();
        self.send_envelope(MessageType::Bind, client_id, &target_id, head::DG_LAB).await;
    }

    /// Answer the bind request and consume the session's acknowledgement.
    pub async fn accept_bind(&mut self) {
        let request = self.recv_envelope().await.unwrap();
        assert_eq!(request.kind, MessageType::Bind);
        assert_eq!(request.message, head::TARGET_ID);

        self.client_id = request.client_id.clone();
        self.reply_bind(&request.client_id).await;

        let ack = self.recv_envelope().await.unwrap();
        assert_eq!(ack.kind, MessageType::Bind);
        assert_eq!(ack.message, ret_code::SUCCESS);
    }

    /// Next `msg` payload, skipping heartbeats.
    pub async fn recv_msg(&mut self) -> String {
        loop {
            let envelope = self.recv_envelope().await.expect("link closed");
            if envelope.kind == MessageType::Msg {
                return envelope.message;
            }
        }
    }

    pub async fn drain_reset(&mut self) {
        assert_eq!(self.recv_msg().await, "clear-1");
        assert_eq!(self.recv_msg().await, "clear-2");
    }

    pub async fn send_msg(&mut self, payload: &str) {
        let (client_id, target_id) = (self.client_id.clone(), self.target_id.clone());
        self.send_envelope(MessageType::Msg, &client_id, &target_id, payload).await;
    }

    pub async fn report_strength(&mut self, a: u32, b: u32, limit_a: u32, limit_b: u32) {
        self.send_msg(&format!("strength-{a}+{b}+{limit_a}+{limit_b}")).await;
    }

    pub async fn disconnect(self) {
        self.peer.close().await;
    }

    /// Hand the device to a background loop that behaves like hardware:
    /// strength commands are applied up to the limit and reported back.
    pub fn simulate(mut self, limit_a: u32, limit_b: u32) -> DeviceSim {
        let state = Arc::new(Mutex::new(SimState {
            strength: [0, 0],
            limit: [limit_a, limit_b],
            max_seen: [0, 0],
            messages: Vec::new(),
        }));
        let shared = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            self.report_strength(0, 0, limit_a, limit_b).await;

            while let Some(envelope) = self.recv_envelope().await {
                if envelope.kind != MessageType::Msg {
                    continue;
                }
                let report = {
                    let mut sim = shared.lock().unwrap();
                    sim.messages.push(envelope.message.clone());
                    sim.apply(&envelope.message)
                };
                if let Some([a, b, la, lb]) = report {
                    self.report_strength(a, b, la, lb).await;
                }
            }
        });

        DeviceSim { state, handle }
    }
}

/// Hardware state tracked by [`FakeDevice::simulate`].
#[derive(Debug)]
pub struct SimState {
    pub strength: [u32; 2],
    pub limit: [u32; 2],
    pub max_seen: [u32; 2],
    pub messages: Vec<String>,
}

impl SimState {
    fn apply(&mut self, message: &str) -> Option<[u32; 4]> {
        let body = message.strip_prefix("strength-")?;
        let parts: Vec<u32> = body.split('+').map(|p| p.parse().unwrap()).collect();
        let [channel, op, value] = parts[..] else { return None };
        let idx = (channel - 1) as usize;

        let next = match op {
            0 => self.strength[idx].saturating_sub(value),
            1 => self.strength[idx] + value,
            _ => value,
        };
        self.strength[idx] = next.min(self.limit[idx]);
        self.max_seen[idx] = self.max_seen[idx].max(next);

        Some([self.strength[0], self.strength[1], self.limit[0], self.limit[1]])
    }
}

pub struct DeviceSim {
    pub state: Arc<Mutex<SimState>>,
    pub handle: JoinHandle<()>,
}

impl DeviceSim {
    pub fn strength(&self) -> [u32; 2] {
        self.state.lock().unwrap().strength
    }

    pub fn max_seen(&self) -> [u32; 2] {
        self.state.lock().unwrap().max_seen
    }

    pub fn messages(&self) -> Vec<String> {
        self.state.lock().unwrap().messages.clone()
    }
}

fn test_transport() -> TransportConfig {
    TransportConfig {
        idle_timeout: None,
        ..TransportConfig::default()
    }
}

/// Run the full handshake against a [`FakeDevice`].
pub async fn connect_pair(client_id: Option<&str>) -> (Arc<DgLabSession>, FakeDevice) {
    let (link, peer) = memory_pair(test_transport());
    let mut device = FakeDevice::new(peer);

    let (session, ()) = tokio::join!(
        DgLabSession::connect(link, client_id.map(str::to_string), SessionConfig::default()),
        device.accept_bind(),
    );

    (session.unwrap(), device)
}

/// Handshake, then hand the device to a simulator.
pub async fn connect_simulated(
    client_id: &str,
    limit_a: u32,
    limit_b: u32,
) -> (Arc<DgLabSession>, DeviceSim) {
    let (session, mut device) = connect_pair(Some(client_id)).await;
    device.drain_reset().await;
    let sim = device.simulate(limit_a, limit_b);

    // wait for the initial report to land
    let mut events = session.subscribe();
    while session.strength(coyote_core::Channel::A).limit != limit_a {
        let _ = events.recv().await;
    }

    (session, sim)
}
