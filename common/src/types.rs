// Copyright 2023 Oxide Computer Company
//! Identifiers and small enums shared by the engine and the harness.
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::EnumIter;

/// Largest raid group width, and the number of bits in a [`DegradedBitmask`]
pub const MAX_WIDTH: usize = 16;

/// Logical block address
///
/// Checkpoints are `Option<Lba>`; `None` means "not running / complete".
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Lba(pub u64);

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a member within a raid group
///
/// Guaranteed by construction (through [`Position::new`]) to be below
/// [`MAX_WIDTH`].
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub u8);

impl Position {
    /// # Panics
    /// If `i >= MAX_WIDTH`
    pub fn new(i: usize) -> Self {
        assert!(i < MAX_WIDTH, "position {i} out of range");
        Self(i as u8)
    }

    /// Iterate over every position of a raid group of the given width
    pub fn iter(width: usize) -> impl Iterator<Item = Self> {
        (0..width.min(MAX_WIDTH)).map(|i| Self(i as u8))
    }

    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Engine object identifier (raid groups, mirrors under a RAID10, LUNs)
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Job service ticket returned by every configuration request
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct JobNumber(pub u64);

impl fmt::Display for JobNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One of the two storage processors
#[derive(
    Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, EnumIter,
)]
pub enum SpId {
    A,
    B,
}

impl SpId {
    pub fn peer(&self) -> SpId {
        match self {
            SpId::A => SpId::B,
            SpId::B => SpId::A,
        }
    }
}

impl fmt::Display for SpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpId::A => write!(f, "SPA"),
            SpId::B => write!(f, "SPB"),
        }
    }
}

/// Physical address of a (simulated) drive
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct DriveLocation {
    pub bus: u32,
    pub enclosure: u32,
    pub slot: u32,
}

impl DriveLocation {
    pub fn new(bus: u32, enclosure: u32, slot: u32) -> Self {
        DriveLocation {
            bus,
            enclosure,
            slot,
        }
    }
}

impl fmt::Display for DriveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

#[derive(
    Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid3,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidType {
    /// Checks that `width` is legal for this raid type
    pub fn valid_width(&self, width: usize) -> bool {
        if width == 0 || width > MAX_WIDTH {
            return false;
        }
        match self {
            RaidType::Raid0 => true,
            RaidType::Raid1 => (2..=3).contains(&width),
            RaidType::Raid3 => width == 5 || width == 9,
            RaidType::Raid5 => width >= 3,
            RaidType::Raid6 => width >= 4 && width % 2 == 0,
            RaidType::Raid10 => width >= 2 && width % 2 == 0,
        }
    }

    /// How many members may be missing at once before the raid group
    /// loses redundancy and has to go to [`LifecycleState::Fail`]
    ///
    /// For RAID10 this is the per-mirror value.
    pub fn tolerated_failures(&self, width: usize) -> usize {
        match self {
            RaidType::Raid0 => 0,
            RaidType::Raid1 => width.saturating_sub(1),
            RaidType::Raid3 | RaidType::Raid5 => 1,
            RaidType::Raid6 => 2,
            RaidType::Raid10 => 1,
        }
    }

    pub fn is_redundant(&self) -> bool {
        !matches!(self, RaidType::Raid0)
    }
}

/// The five independent background verify checkpoints
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum VerifyType {
    ReadWrite,
    ReadOnly,
    Error,
    System,
    IncompleteWrite,
}

impl fmt::Display for VerifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerifyType::ReadWrite => "rw",
            VerifyType::ReadOnly => "ro",
            VerifyType::Error => "error",
            VerifyType::System => "system",
            VerifyType::IncompleteWrite => "incomplete_write",
        };
        write!(f, "{s}")
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, not yet through its first monitor cycle
    Specialize,
    Ready,
    /// Too many members missing at once; no background work runs
    Fail,
    Destroy,
}

/// Which SP owns the authoritative copy of an object's state
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataElementState {
    Active,
    Passive,
}

bitflags! {
    /// Flags replicated (with lag) between the two SPs
    #[derive(
        Copy, Clone, Debug, Default, Eq, Hash, PartialEq, Serialize,
        Deserialize,
    )]
    pub struct ClusteredFlags: u32 {
        const QUIESCING = 1 << 0;
        const QUIESCED = 1 << 1;
        const UNQUIESCING = 1 << 2;
        const DEGRADED = 1 << 3;
        const REBUILDING = 1 << 4;
    }
}

/// One bit per member position; bit `i` set means position `i` is degraded
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct DegradedBitmask(pub u16);

impl DegradedBitmask {
    pub fn empty() -> Self {
        DegradedBitmask(0)
    }

    pub fn from_positions(positions: &[Position]) -> Self {
        let mut m = Self::empty();
        for p in positions {
            m.set(*p);
        }
        m
    }

    /// Bit for `pos`; zero for a position past [`MAX_WIDTH`]
    fn bit(pos: Position) -> u16 {
        1u16.checked_shl(pos.0 as u32).unwrap_or(0)
    }

    /// Positions past [`MAX_WIDTH`] are ignored
    pub fn set(&mut self, pos: Position) {
        self.0 |= Self::bit(pos);
    }

    pub fn contains(&self, pos: Position) -> bool {
        self.0 & Self::bit(pos) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        Position::iter(MAX_WIDTH).filter(|p| self.contains(*p))
    }
}

impl fmt::Display for DegradedBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

/// Job-level result codes
///
/// A job can run to completion (`JobStatus::Ok`) and still refuse the
/// request; the caller must look at the error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    NoError,
    /// Cannot destroy a raid group while LUNs are bound on it
    RequestObjectHasUpstreamEdges,
    PvdIsConfiguredAsSpare,
    PvdIsInUseForRaidGroup,
    InvalidRaidGroupNumber,
    InvalidConfiguration,
    ObjectNotFound,
    DriveNotFound,
    SpareNotApplicable,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ok,
    Failed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub error_code: JobErrorCode,
    /// Object created by the job, if any
    pub object_id: Option<ObjectId>,
}

impl JobResult {
    pub fn success(object_id: Option<ObjectId>) -> Self {
        JobResult {
            status: JobStatus::Ok,
            error_code: JobErrorCode::NoError,
            object_id,
        }
    }

    pub fn rejected(error_code: JobErrorCode) -> Self {
        JobResult {
            status: JobStatus::Ok,
            error_code,
            object_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Ok && self.error_code == JobErrorCode::NoError
    }
}
