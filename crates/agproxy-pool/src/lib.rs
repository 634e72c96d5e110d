//! Credential pool, cooldown engine, and the signature cache.
//!
//! State is split the way the wire stores it: immutable OAuth material
//! (`CredentialRecord`) and mutable runtime state (`CredentialState`) live
//! under separate storage keys, so a token refresh never races a cooldown
//! write.

pub mod cooldown;
pub mod pool;
pub mod quota;
pub mod record;
pub mod signature;
pub mod storage;
pub mod verify;

pub use cooldown::{classify_429_lockout, parse_cooldown_hint, tiered_quota_lockout};
pub use pool::{CredentialPool, Outcome, PoolSettings};
pub use quota::QuotaCache;
pub use record::{CredentialRecord, CredentialState, StatePatch};
pub use signature::SignatureCache;
pub use storage::{FileStore, MemoryStore, Storage, StorageError};
pub use verify::{AutoVerify, VerifySettings};
