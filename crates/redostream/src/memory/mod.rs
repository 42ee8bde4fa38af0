//! Memory management: the chunk arena, the per-transaction swap registry,
//! and the swap daemon that spills cold transaction chunks to disk.

pub mod arena;
pub mod manager;
pub mod swap;

pub use arena::{Arena, ArenaConfig, ArenaStats, Chunk};
pub use manager::MemoryManager;
pub use swap::{SwapRegistry, SwapStats};
