pub mod codec;
mod kv;
mod lock;
mod memkv;
mod overlay;
mod redbkv;

pub use codec::{decode, decode_prefix, encode, CodecError, Elem};
pub use kv::{Batch, BatchAccumulator, Kv, KvEntry, LockGuard, MAYBE_APPLY_THRESHOLD};
pub use memkv::MemKv;
pub use overlay::Overlay;
pub use redbkv::RedbKv;
