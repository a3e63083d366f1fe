//! # miband-rs
//!
//! Async Rust client for Xiaomi Mi Band fitness trackers over Bluetooth Low
//! Energy: pre-shared-key authentication, minute-by-minute history download,
//! live heart-rate streaming, and background heart-rate monitor settings.
//!
//! ## Quick start
//!
//! ```no_run
//! use miband_rs::prelude::*;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let identity = DeviceIdentity::from_hex("AA:BB:CC:DD:EE:FF", "000102030405060708090a0b0c0d0e0f")?;
//!     let transport = BtleplugTransport::find(&identity.address, BtleplugConfig::default()).await?;
//!     let session = Session::new(transport, identity, SessionConfig::default());
//!     session.connect().await?;
//!
//!     let since = resume_point(None, chrono::Local::now().naive_local());
//!     for record in session.fetch_since(since).await? {
//!         println!("{} steps={} hr={:?}", record.time, record.steps, record.heart_rate());
//!     }
//!
//!     let mut stream = session.start_heart_rate_stream().await?;
//!     while let Some(sample) = stream.next().await {
//!         println!("{} bpm", sample?.bpm);
//!     }
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | Connection lifecycle, state machine, and the event dispatcher |
//! | [`fetch`] | Historical activity download |
//! | [`heart_rate`] | Live heart-rate streaming and background monitor settings |
//! | [`auth`] | AES challenge-response handshake |
//! | [`registry`] | Correlation of GATT writes with their completion events |
//! | [`queue`] | Per-characteristic notification queues |
//! | [`transport`] | The [`transport::Transport`] seam and the btleplug adapter |
//! | [`codec`] | Byte-level encoders and decoders for the band's wire formats |
//! | [`protocol`] | GATT UUIDs and command constants |
//! | [`store`] | Persistence seam for decoded records and samples |
//! | [`types`] | Data types shared across the crate |
//! | [`error`] | Error taxonomy |

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod auth;
pub mod codec;
pub mod error;
pub mod fetch;
pub mod heart_rate;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// None of the guarded structures can be left half-updated by a panic, so a
/// poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::fetch::resume_point;
    pub use crate::heart_rate::HeartRateStream;
    pub use crate::session::{Session, SessionDiagnostics};

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::ble::{BtleplugConfig, BtleplugTransport};
    pub use crate::transport::{Transport, TransportEvent};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::{BandError, TransportError};
    pub use crate::store::{MemoryStore, SampleStore};
    pub use crate::types::{
        ActivityRecord, DeviceIdentity, EmptyChunkPolicy, HeartBeatSample, OverflowPolicy,
        SessionConfig, SessionState,
    };
}
