//! Shared building blocks: identifier types, the error taxonomy, and the
//! engine context handed to every worker.

pub mod ctx;
pub mod error;
pub mod types;

pub use ctx::{Ctx, ShutdownState};
pub use error::{Error, Result};
pub use types::{
    LobId, MemoryModule, Scn, Xid, CHUNK_SIZE, CHUNK_SIZE_MB, CONFIG_FILE_MAX_SIZE,
};
