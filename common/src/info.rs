// Copyright 2023 Oxide Computer Company
//! Snapshot of a raid group's live state, and the predicates tests use to
//! decide whether rebuild and verify are done.
//!
//! These are pure functions over one snapshot.  Checkpoints keep moving
//! while background operations run, so a caller that needs the current
//! answer has to fetch a fresh [`RaidGroupInfo`]; never hold one across an
//! operation that might change state.
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::types::{
    ClusteredFlags, DegradedBitmask, LifecycleState, Lba,
    MetadataElementState, ObjectId, Position, RaidType, VerifyType,
};

/// Running totals of what background verify has found
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Completed verify passes, of any type
    pub passes_completed: u64,
    /// Media errors found by a verify pass
    pub errors_found: u64,
    /// Media errors fixed by an error verify
    pub errors_corrected: u64,
    /// Errors a rebuild could not reconstruct around
    pub uncorrectable_errors: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaidGroupInfo {
    pub object_id: ObjectId,
    pub raid_type: RaidType,
    pub width: usize,
    /// Exported blocks per member
    pub capacity: u64,
    /// Blocks per background-operation chunk
    pub chunk_size: u64,
    pub lifecycle_state: LifecycleState,
    pub metadata_element_state: MetadataElementState,

    /// Position's drive is gone and writes to it are being logged
    pub rb_logging: Vec<bool>,
    /// `None` means the position is not rebuilding
    pub rebuild_checkpoint: Vec<Option<Lba>>,

    pub rw_verify_checkpoint: Option<Lba>,
    pub ro_verify_checkpoint: Option<Lba>,
    pub error_verify_checkpoint: Option<Lba>,
    pub system_verify_checkpoint: Option<Lba>,
    pub incomplete_write_verify_checkpoint: Option<Lba>,

    /// Provision-drive zeroing progress, `None` once every member is zeroed
    pub zero_checkpoint: Option<Lba>,

    pub base_config_clustered_flags: ClusteredFlags,
    /// `false` while requests are queued but not yet applied to checkpoints
    pub is_event_q_empty: bool,
    pub verify_report: VerifyReport,
}

impl RaidGroupInfo {
    pub fn verify_checkpoint(&self, vt: VerifyType) -> Option<Lba> {
        match vt {
            VerifyType::ReadWrite => self.rw_verify_checkpoint,
            VerifyType::ReadOnly => self.ro_verify_checkpoint,
            VerifyType::Error => self.error_verify_checkpoint,
            VerifyType::System => self.system_verify_checkpoint,
            VerifyType::IncompleteWrite => {
                self.incomplete_write_verify_checkpoint
            }
        }
    }

    pub fn is_position_degraded(&self, pos: Position) -> bool {
        let i = pos.get();
        self.rb_logging.get(i).copied().unwrap_or(false)
            || self
                .rebuild_checkpoint
                .get(i)
                .map(|c| c.is_some())
                .unwrap_or(false)
    }

    pub fn is_degraded(&self) -> bool {
        Position::iter(self.width).any(|p| self.is_position_degraded(p))
    }

    /// Bit per degraded position, for waiting on an exact pattern
    pub fn degraded_bitmask(&self) -> DegradedBitmask {
        let mut m = DegradedBitmask::empty();
        for p in Position::iter(self.width) {
            if self.is_position_degraded(p) {
                m.set(p);
            }
        }
        m
    }

    /// All five verify checkpoints are clear and nothing is queued
    ///
    /// The event queue check is required: a verify request that has been
    /// accepted but not yet applied leaves every checkpoint clear.
    pub fn verify_is_finished(&self) -> bool {
        VerifyType::iter().all(|vt| self.verify_checkpoint(vt).is_none())
            && self.is_event_q_empty
    }

    pub fn rebuild_is_finished(&self) -> bool {
        self.rebuild_checkpoint.iter().all(|c| c.is_none())
            && !self.rb_logging.iter().any(|b| *b)
    }

    pub fn zeroing_is_finished(&self) -> bool {
        self.zero_checkpoint.is_none()
    }

    pub fn is_quiesced(&self) -> bool {
        self.base_config_clustered_flags
            .contains(ClusteredFlags::QUIESCED)
    }
}

/// Degraded-ness of a RAID10: OR over the underlying mirrors
///
/// Positions are not compared across the striper width; any degraded
/// mirror makes the whole composite degraded.
pub fn composite_is_degraded(mirrors: &[RaidGroupInfo]) -> bool {
    mirrors.iter().any(|m| m.is_degraded())
}
