//! Host-wide network-slot allocation.
//!
//! Each sandbox owns one slot in `[1, 254]`, which fixes its `/24` network,
//! its container IP, and its container name. Allocation is first-fit and only
//! happens under the sandbox lock, so the used set cannot change underneath
//! the search.

use std::collections::BTreeSet;

use crate::error::ForageErr;
use crate::error::Result;
use crate::metadata::SandboxMetadata;

pub const MIN_SLOT: u8 = 1;
pub const MAX_SLOT: u8 = 254;

/// Lowest free slot in `[1, 254]`, or `NoSlotsAvailable` when all are taken.
pub fn allocate_slot(used: &BTreeSet<u8>) -> Result<u8> {
    (MIN_SLOT..=MAX_SLOT)
        .find(|slot| !used.contains(slot))
        .ok_or(ForageErr::NoSlotsAvailable)
}

/// Slots currently claimed by persisted sandboxes.
pub fn used_slots<'a, I>(sandboxes: I) -> BTreeSet<u8>
where
    I: IntoIterator<Item = &'a SandboxMetadata>,
{
    sandboxes.into_iter().map(|m| m.network_slot).collect()
}

pub fn container_ip(slot: u8) -> String {
    format!("10.100.{slot}.2")
}

pub fn host_ip(slot: u8) -> String {
    format!("10.100.{slot}.1")
}

/// Deterministic container name, stable for the lifetime of the sandbox even
/// if the sandbox name differs.
pub fn container_name(prefix: &str, slot: u8) -> String {
    format!("{prefix}-{slot}")
}
