//! Test doubles for the sync engine: an in-memory transport pair, a JSON
//! pass-through codec and an in-memory storage plugin with inspectable
//! state. Used by the engine's own tests and by integration harnesses.

pub mod codec;
pub mod storage;
pub mod transport;

pub use codec::JsonCodec;
pub use storage::{MemoryStore, MockStorage, MockStorageProvider};
pub use transport::MockTransport;
