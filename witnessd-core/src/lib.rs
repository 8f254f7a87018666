pub mod chains;
pub mod config;
pub mod crypto;
pub mod datadir;
pub mod declaration;
pub mod engine;
pub mod event;
pub mod evidence;
pub mod keyhierarchy;
pub mod sentinel;
pub mod shadow;
pub mod store;
pub mod topology;
pub mod vdf;
pub mod wal;

// Re-export common types
pub use crate::crypto::{compute_event_hash, derive_hmac_key, hash_content};
pub use crate::engine::Engine;
pub use crate::event::Event;
pub use crate::shadow::{ShadowCache, ShadowFile, ShadowStrategy};
pub use crate::store::{SecureStore, StoreStats};
pub use crate::topology::{extract_topology, regions_root, DeltaSign, EditRegion};
pub use crate::vdf::{Parameters, VdfProof};
