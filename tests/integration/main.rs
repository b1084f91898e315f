//! Pulse integration test harness.
//!
//! Every test builds a small mesh of relay nodes on a shared in-memory
//! medium. Nodes run their real actor tasks; only time and the backend
//! are simulated:
//!
//!   cargo test --test integration
//!
//! Nodes tick manually so each test decides when frames go on air.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{broadcast, watch};

use pulse_services::{
    ManualClock, MemoryBackend, NodeEvent, NodeHandle, NodeSettings, NodeStatus, RelayNode,
    SimEndpoint, SimMedium, TickOutcome,
};

mod faults;
mod presence;
mod reconnect;
mod routing;
mod scheduling;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on tick rounds before a mesh is declared stuck.
const MAX_ROUNDS: usize = 500;
/// Consecutive all-idle rounds required before a mesh counts as settled.
const QUIET_ROUNDS: usize = 3;

pub struct Device {
    pub name: String,
    pub endpoint: SimEndpoint,
    pub backend: MemoryBackend,
    pub online: watch::Sender<bool>,
    pub node: NodeHandle,
    events: broadcast::Receiver<NodeEvent>,
}

pub struct Mesh {
    pub medium: SimMedium,
    pub clock: ManualClock,
    pub devices: Vec<Device>,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            medium: SimMedium::new(),
            clock: ManualClock::new(),
            devices: Vec::new(),
        }
    }

    /// Attach a device and start its node. Returns its index.
    pub fn add(&mut self, name: &str, online: bool) -> usize {
        let endpoint = self.medium.endpoint();
        let backend = MemoryBackend::new();
        let (online_tx, online_rx) = watch::channel(online);
        let node = RelayNode::spawn(
            NodeSettings::new(name).manual(),
            Arc::new(endpoint.clone()),
            &endpoint,
            Arc::new(backend.clone()),
            online_rx,
            Arc::new(self.clock.clone()),
        )
        .expect("node should start");
        let events = node.subscribe();
        self.devices.push(Device {
            name: name.to_string(),
            endpoint,
            backend,
            online: online_tx,
            node,
            events,
        });
        self.devices.len() - 1
    }

    pub fn node(&self, i: usize) -> &NodeHandle {
        &self.devices[i].node
    }

    /// Make two devices unable to hear each other.
    pub fn cut(&self, a: usize, b: usize) {
        self.medium
            .set_reachable(&self.devices[a].endpoint, &self.devices[b].endpoint, false);
    }

    pub async fn status(&self, i: usize) -> NodeStatus {
        self.node(i).status().await.expect("node should answer")
    }

    /// Flip a device's connectivity and wait until its node has seen it.
    pub async fn set_online(&self, i: usize, online: bool) -> Result<()> {
        self.devices[i].online.send_replace(online);
        for _ in 0..200 {
            if self.status(i).await.online == online {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        bail!("{} never observed online={}", self.devices[i].name, online)
    }

    /// Tick every node until nothing is left to send and backend calls
    /// have had a chance to land. Returns how many frames went out.
    pub async fn settle(&self) -> Result<usize> {
        let mut sent = 0;
        let mut quiet = 0;
        for _ in 0..MAX_ROUNDS {
            let mut idle = true;
            for device in &self.devices {
                match device.node.tick().await? {
                    TickOutcome::Sent { .. } => {
                        sent += 1;
                        idle = false;
                    }
                    TickOutcome::SendFailed { .. } => idle = false,
                    TickOutcome::Idle | TickOutcome::Stopped => {}
                }
            }
            // frames delivered during the ticks are queued ahead of this
            for device in &self.devices {
                device.node.status().await?;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;

            quiet = if idle { quiet + 1 } else { 0 };
            if quiet >= QUIET_ROUNDS {
                return Ok(sent);
            }
        }
        bail!("mesh did not settle within {} rounds", MAX_ROUNDS)
    }

    /// Everything the device's node has emitted since the last call.
    pub fn events(&mut self, i: usize) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.devices[i].events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Responses delivered to the device, as `(query_id, text)`.
    pub fn responses(&mut self, i: usize) -> Vec<(String, String)> {
        self.events(i)
            .into_iter()
            .filter_map(|e| match e {
                NodeEvent::Response { query_id, text } => Some((query_id, text)),
                _ => None,
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        for device in &self.devices {
            device.node.shutdown().await;
        }
    }
}

/// A mesh of `(name, online)` devices that can all hear each other.
pub fn mesh(devices: &[(&str, bool)]) -> Mesh {
    let mut mesh = Mesh::new();
    for (name, online) in devices {
        mesh.add(name, *online);
    }
    mesh
}
