pub mod coordinator;
pub mod source;
pub mod worker;

pub use coordinator::{DecoderPool, PoolCommand};
pub use worker::{DecodeNotice, DecodeStart, LoopFlags};
