//! Transport, protocol, and stash core for an IoT agent client.
//!
//! Mediates between local data sources and a remote broker-mediated
//! container over a signed, sequenced request/response + pub/sub wire
//! protocol. See `DESIGN.md` for the grounding of each module.

pub mod codec;
pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod flush_pool;
pub mod link;
pub mod protocol;
pub mod request_table;
pub mod resource;
pub mod stash;

pub use config::Config;
pub use error::QapiError;
pub use flush_pool::FlushPool;
pub use link::{Link, LinkState};
pub use protocol::ProtocolClient;
pub use request_table::{RequestEvent, RequestTable};
pub use resource::remote::{RemoteControl, RemoteFeed};
pub use resource::{Point, PointKind, Thing, Value};
pub use stash::Stash;
