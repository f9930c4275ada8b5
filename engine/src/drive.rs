// Copyright 2023 Oxide Computer Company
//! Simulated physical drives
//!
//! Every drive slot in the array has a [`DriveRecord`]; pulling a drive
//! leaves the record in place (so the raid group still knows which slot
//! the member lives in) and hands the caller a [`DriveHandle`] that must be
//! presented again on reinsertion.
use std::collections::BTreeMap;
use std::time::Duration;

use sep_common::{sep_bail, DriveLocation, ObjectId, SepError};
use tokio::time::Instant;

/// Proof that a drive was pulled, needed to put the same drive back
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveHandle {
    location: DriveLocation,
    serial: u64,
    generation: u64,
}

impl DriveHandle {
    pub fn location(&self) -> DriveLocation {
        self.location
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DriveState {
    Ready,
    Pulled { generation: u64 },
    /// The drive bounces for a while and then comes back on its own
    Glitching { since: Instant, until: Instant },
}

/// What the configuration database has bound a drive to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DriveUse {
    Unbound,
    RaidGroup(ObjectId),
    HotSpare,
}

#[derive(Clone, Debug)]
pub(crate) struct DriveRecord {
    /// Changes whenever a new physical drive is put into the slot
    pub serial: u64,
    pub capacity: u64,
    pub state: DriveState,
    pub used_by: DriveUse,
}

#[derive(Debug, Default)]
pub(crate) struct DrivePool {
    drives: BTreeMap<DriveLocation, DriveRecord>,
    next_serial: u64,
    next_generation: u64,
}

impl DrivePool {
    /// Put a brand new drive into `location`
    ///
    /// The slot must be empty or hold a pulled drive; a replacement keeps
    /// whatever binding the old drive had, but with a new serial number.
    pub fn insert_new(
        &mut self,
        location: DriveLocation,
        capacity: u64,
    ) -> Result<(), SepError> {
        self.next_serial += 1;
        let serial = self.next_serial;
        match self.drives.get_mut(&location) {
            Some(d) if matches!(d.state, DriveState::Pulled { .. }) => {
                d.serial = serial;
                d.capacity = capacity;
                d.state = DriveState::Ready;
            }
            Some(_) => {
                sep_bail!(InvalidArgument, "drive {} is present", location)
            }
            None => {
                self.drives.insert(
                    location,
                    DriveRecord {
                        serial,
                        capacity,
                        state: DriveState::Ready,
                        used_by: DriveUse::Unbound,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn pull(
        &mut self,
        location: DriveLocation,
    ) -> Result<DriveHandle, SepError> {
        let Some(d) = self.drives.get_mut(&location) else {
            sep_bail!(DriveNotFound, location);
        };
        if let DriveState::Pulled { .. } = d.state {
            sep_bail!(DriveAlreadyPulled, location);
        }
        self.next_generation += 1;
        d.state = DriveState::Pulled {
            generation: self.next_generation,
        };
        Ok(DriveHandle {
            location,
            serial: d.serial,
            generation: self.next_generation,
        })
    }

    pub fn reinsert(
        &mut self,
        location: DriveLocation,
        handle: DriveHandle,
    ) -> Result<(), SepError> {
        let Some(d) = self.drives.get_mut(&location) else {
            sep_bail!(DriveNotFound, location);
        };
        match d.state {
            DriveState::Pulled { generation }
                if generation == handle.generation
                    && d.serial == handle.serial
                    && handle.location == location =>
            {
                d.state = DriveState::Ready;
                Ok(())
            }
            _ => sep_bail!(DriveHandleMismatch, location),
        }
    }

    pub fn glitch(
        &mut self,
        location: DriveLocation,
        duration: Duration,
        now: Instant,
    ) -> Result<(), SepError> {
        let Some(d) = self.drives.get_mut(&location) else {
            sep_bail!(DriveNotFound, location);
        };
        if let DriveState::Pulled { .. } = d.state {
            sep_bail!(DriveAlreadyPulled, location);
        }
        d.state = DriveState::Glitching {
            since: now,
            until: now + duration,
        };
        Ok(())
    }

    /// Serial number of the drive in `location`, if the drive is usable
    ///
    /// A glitching drive is still reported as present until it has been
    /// gone for longer than `debounce`.
    pub fn present_serial(
        &self,
        location: DriveLocation,
        now: Instant,
        debounce: Duration,
    ) -> Option<u64> {
        let d = self.drives.get(&location)?;
        match d.state {
            DriveState::Ready => Some(d.serial),
            DriveState::Pulled { .. } => None,
            DriveState::Glitching { since, until } => {
                if now >= until || now.duration_since(since) <= debounce {
                    Some(d.serial)
                } else {
                    None
                }
            }
        }
    }

    pub fn get(&self, location: DriveLocation) -> Option<&DriveRecord> {
        self.drives.get(&location)
    }

    pub fn set_use(&mut self, location: DriveLocation, used_by: DriveUse) {
        if let Some(d) = self.drives.get_mut(&location) {
            d.used_by = used_by;
        }
    }

    /// Hot spares large enough to stand in for a `capacity`-block member
    pub fn spares(
        &self,
        capacity: u64,
    ) -> impl Iterator<Item = DriveLocation> + '_ {
        self.drives.iter().filter_map(move |(loc, d)| {
            (d.used_by == DriveUse::HotSpare
                && d.state == DriveState::Ready
                && d.capacity >= capacity)
                .then_some(*loc)
        })
    }

    pub fn locations(&self) -> Vec<DriveLocation> {
        self.drives.keys().copied().collect()
    }
}
