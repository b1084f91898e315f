//! pulse-core: wire format, relay payload schema, and configuration.
//! All other Pulse crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{Location, QueryKind, RelayMessage};
pub use wire::{decode, DecodedFragment, EncodeOptions, EncodedMessage, FragmentCodec, MessageId};
