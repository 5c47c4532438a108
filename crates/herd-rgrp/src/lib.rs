#![forbid(unsafe_code)]
//! Resource-group block allocation.
//!
//! A volume is carved into fixed-size resource groups, each with its own
//! header and 2-bit allocation bitmap, so that every node in the cluster can
//! allocate out of a different group without fighting over one global bitmap.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **bitmap** — pure 2-bit cell manipulation on raw byte ranges.
//! 2. **rgrp** — one group's descriptor: cached header and bitmap buffers,
//!    clone shadows, checkout/checkin, per-block search and free.
//! 3. **rindex** — the ordered group list loaded from the resource index
//!    file, with MRU lookup and grow-triggered reload.
//! 4. **reserve** — group selection: recent-list scan, then a two-circuit
//!    round-robin walk with try-locks.
//! 5. **volume** — the per-volume session tying the above to the cluster
//!    collaborators, plus the allocate/free entry points.

pub mod alloc;
pub mod bitmap;
pub mod inode;
pub mod reserve;
pub mod rgrp;
pub mod rindex;
pub mod volume;

pub use inode::{Inode, InodeFlags};
pub use reserve::Reservation;
pub use rgrp::{AllocKind, ResourceGroup, RgrpGuard, RgrpHeader, format_resource_group};
pub use rindex::{RindexEntry, RindexSource, VecRindexSource, encode_rindex};
pub use volume::{RgrpHolds, RgrpList, Services, Volume};
