//! Module discovery: a typed, self-updating view of the registration tree.

pub mod cache;
pub mod codec;
mod engine;

pub use cache::{ModuleCache, key_matches};
pub use codec::{CodecRegistry, DecodeFn, json_decoder};
pub use engine::{DiscoveryFatal, DiscoveryOptions, ModuleDiscovery};
