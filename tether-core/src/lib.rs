//! OMA DS (SyncML) data-synchronization engine.
//!
//! Implements both client and server roles of protocol versions 1.1 and 1.2:
//! session negotiation, the phased command exchange, change buffering with
//! conflict resolution and large-object reassembly, durable anchors and UID
//! maps, and basic/MD5 session authentication. The wire codec, the transport
//! and the datastores are external collaborators behind the [`wire::codec`],
//! [`transport`] and [`storage`] seams.

pub mod agent;
pub mod auth;
pub mod command;
pub mod config;
pub mod device_info;
pub mod devinf;
pub mod persist;
pub mod proto;
pub mod response;
pub mod results;
pub mod session;
pub mod storage;
pub mod sync_mode;
pub mod target;
pub mod transport;
pub mod wire;

pub use agent::{AbortHandle, SyncAgent};
pub use config::{DatabasePair, SessionConfig};
pub use proto::{ProtocolVersion, Role};
pub use results::SyncResults;
pub use session::{SessionEvent, SessionHandler, SyncState};
