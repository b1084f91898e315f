//! pulse-services: the relay protocol state and the node actor that owns it.

pub mod backend;
pub mod clock;
pub mod medium;
pub mod node;
pub mod peer;
pub mod reassembly;
pub mod relay;
pub mod scheduler;
pub mod ttl_cache;

pub use backend::{
    BackendError, CheckOutcome, HttpBackend, IncidentReport, MemoryBackend, RelayBackend,
    RelayQueryRequest,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use medium::{FrameCallback, FrameScanner, FrameSender, SimEndpoint, SimMedium, TransportError};
pub use node::{NodeError, NodeEvent, NodeHandle, NodeSettings, NodeStatus, RelayNode};
pub use peer::PeerActivity;
pub use reassembly::{Accepted, CompletedMessage, IgnoreReason, Phase, ReassemblyTracker};
pub use relay::{NewQuery, NewReport, RelayAction, RelayLayer, RelaySettings, ReplyRoute};
pub use scheduler::{BroadcastScheduler, TickOutcome};
pub use ttl_cache::TtlCache;
