//! Conditional-write verification.
//!
//! A conditional write is a version fingerprint, not a numeric check: the
//! destination must hold the exact expected bytes (float bit patterns
//! included) or the write is skipped and the image left untouched. Skipping
//! is the one non-fatal outcome in the engine; whether a skip fails the whole
//! patch set is a policy decision left to the caller.

use log::warn;

use super::image::Image;
use super::{PatchOp, ResolvedPatch};

/// Result of applying one record to an image snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record was written
    Applied,
    /// The fingerprint did not match; `actual` holds what the destination
    /// really contained, and nothing was written
    Skipped {
        /// Bytes found at the destination
        actual: Vec<u8>,
    },
    /// The record cannot be settled against this snapshot (it falls outside
    /// the image, or awaits a final-link address) and is left for the
    /// runtime loader
    Deferred,
}

/// Applies one record to the snapshot.
///
/// Unconditional writes always land; conditional writes land only when the
/// fingerprint matches. Once a conditional write has been applied, a second
/// application reads the new value rather than the fingerprint and reports
/// [`Outcome::Skipped`]; re-application is detectable, not silently absorbed.
pub fn apply(record: &ResolvedPatch, image: &mut Image) -> Outcome {
    match &record.op {
        PatchOp::Write(bytes) => {
            if image.write(record.at, bytes) {
                Outcome::Applied
            } else {
                Outcome::Deferred
            }
        }
        PatchOp::CondWrite { expected, value } => {
            let current = match image.read(record.at, expected.len()) {
                Some(bytes) => bytes.to_vec(),
                None => return Outcome::Deferred,
            };
            if current != *expected {
                warn!(
                    "conditional write at {:#010x} skipped: found {:02x?}, expected {:02x?}",
                    record.at, current, expected
                );
                return Outcome::Skipped { actual: current };
            }
            image.write(record.at, value);
            Outcome::Applied
        }
        PatchOp::RelocBranch { .. } => Outcome::Deferred,
    }
}

/// Applies every record in order, reporting one outcome per record
pub fn apply_all(records: &[ResolvedPatch], image: &mut Image) -> Vec<Outcome> {
    records.iter().map(|record| apply(record, image)).collect()
}
