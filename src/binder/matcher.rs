//! Matching Engine
//!
//! Pure selection of the volume a claim should bind to. Reads only the
//! snapshot it is given; never writes.

use crate::domain::{Claim, Volume, VolumePhase};
use std::cmp::Ordering;

/// Whether `volume` meets the claim's capacity, modes, class and selector
pub fn satisfies(volume: &Volume, claim: &Claim, default_class: Option<&str>) -> bool {
    if volume.spec.capacity < claim.spec.requested {
        return false;
    }
    if !claim.spec.access_modes.is_subset(&volume.spec.access_modes) {
        return false;
    }
    if volume.spec.storage_class_name != claim.spec.storage_class.resolve(default_class) {
        return false;
    }
    claim
        .spec
        .selector
        .as_ref()
        .map_or(true, |s| s.matches(&volume.metadata.labels))
}

/// Volume claimed for exactly this claim and usable for binding
///
/// Covers administrator pre-binds (no UID yet) and a bind interrupted
/// between the volume write and the claim write.
fn is_reserved_for(volume: &Volume, claim: &Claim) -> bool {
    volume.spec.claim_ref.as_ref().map_or(false, |r| r.refers_to(claim))
        && matches!(volume.phase(), VolumePhase::Available | VolumePhase::Bound)
}

/// Unclaimed, available and satisfying the claim
fn is_eligible(volume: &Volume, claim: &Claim, default_class: Option<&str>) -> bool {
    volume.spec.claim_ref.is_none()
        && volume.phase() == VolumePhase::Available
        && satisfies(volume, claim, default_class)
}

/// Best fit: smallest capacity, then oldest, then name
fn best_fit(a: &Volume, b: &Volume) -> Ordering {
    a.spec
        .capacity
        .cmp(&b.spec.capacity)
        .then_with(|| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
        })
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// Whether `volume` may be offered to `claim` at all
pub fn is_candidate(volume: &Volume, claim: &Claim, default_class: Option<&str>) -> bool {
    is_reserved_for(volume, claim) || is_eligible(volume, claim, default_class)
}

/// Select the volume `claim` should bind to
///
/// A volume reserved for this claim wins outright. Volumes whose claim
/// reference names any other claim are never eligible.
pub fn find_match<'a, I>(claim: &Claim, volumes: I, default_class: Option<&str>) -> Option<&'a Volume>
where
    I: IntoIterator<Item = &'a Volume>,
{
    let mut best: Option<&'a Volume> = None;
    for volume in volumes {
        if is_reserved_for(volume, claim) {
            return Some(volume);
        }
        if !is_eligible(volume, claim, default_class) {
            continue;
        }
        best = match best {
            Some(current) if best_fit(current, volume) != Ordering::Greater => Some(current),
            _ => Some(volume),
        };
    }
    best
}
