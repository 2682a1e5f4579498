//! bbque-res: resource tree and multi-view reservation accounting.
//!
//! Models the platform as a tree of quantified resources and tracks
//! reservations made by workloads in one committed view plus a handful of
//! candidate views opened by scheduling policies.
//!
//! # Architecture
//!
//! ```text
//! ResourceAccounter
//!   ├── ResourceTree (path → Resource, offline, degradation, HP flag)
//!   ├── committed view (token + Arc<Ledger>)
//!   ├── open views (token → Mutex<Arc<Ledger>>, copy-on-write)
//!   └── power queue (path → PowerSetting, drained after commit)
//! ```

pub mod accounter;
pub mod binding;
pub mod error;
pub mod ledger;
pub mod power;
pub mod tree;

pub use accounter::{ResourceAccounter, ViewToken};
pub use binding::{ResourceBinding, ResourceRequest, is_reshuffling};
pub use error::{AccountError, AccountResult};
pub use ledger::{Ledger, Reservation};
pub use power::PowerSetting;
pub use tree::{Resource, ResourceTree};
