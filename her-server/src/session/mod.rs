//! Session transcripts: key derivation, turn types and the storage tiers.

pub mod file;
pub mod key;
pub mod memory;
pub mod redis;
pub mod router;
pub mod store;
pub mod types;

pub use file::FileTranscriptStore;
pub use key::SessionKey;
pub use memory::MemoryTranscriptStore;
pub use self::redis::RedisTranscriptStore;
pub use router::{RemoteTier, StoreRouter};
pub use store::{StoreError, StoreResult, TranscriptStore};
pub use types::{Role, Turn};
