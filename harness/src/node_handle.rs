// Copyright 2023 Oxide Computer Company
use sep::{Array, SepHandle};
use sep_common::{MetadataElementState, ObjectId, SepError, SpId};
use slog::{debug, o, Logger};

/// Both SPs of an array, routed by per-object ownership
///
/// Asking for `active(object)` or `passive(object)` always queries the
/// current owner, so a caller never has to track which SP it is
/// "pointed at".
#[derive(Clone, Debug)]
pub struct NodeHandle {
    local: SepHandle,
    peer: Option<SepHandle>,
    log: Logger,
}

impl NodeHandle {
    pub fn new(array: &Array, log: &Logger) -> Self {
        let local = array.local();
        let peer = array.handle(local.sp().peer());
        NodeHandle {
            local,
            peer,
            log: log.new(o!("task" => "nodes")),
        }
    }

    pub fn local(&self) -> &SepHandle {
        &self.local
    }

    pub fn peer(&self) -> Option<&SepHandle> {
        self.peer.as_ref()
    }

    pub fn sp(&self, sp: SpId) -> Option<&SepHandle> {
        if self.local.sp() == sp {
            Some(&self.local)
        } else {
            self.peer.as_ref().filter(|p| p.sp() == sp)
        }
    }

    /// Both handles, local first
    pub fn all(&self) -> impl Iterator<Item = &SepHandle> {
        std::iter::once(&self.local).chain(self.peer.iter())
    }

    /// The SP that owns `object`
    ///
    /// With a single SP this is always the local one.
    pub async fn active(
        &self,
        object: ObjectId,
    ) -> Result<&SepHandle, SepError> {
        let Some(peer) = &self.peer else {
            return Ok(&self.local);
        };
        let state = self.local.get_metadata_element_state(object).await?;
        let h = match state {
            MetadataElementState::Active => &self.local,
            MetadataElementState::Passive => peer,
        };
        debug!(self.log, "{} is active on {}", object, h.sp());
        Ok(h)
    }

    /// The SP that mirrors `object`, or `None` when running single SP
    pub async fn passive(
        &self,
        object: ObjectId,
    ) -> Result<Option<&SepHandle>, SepError> {
        let Some(peer) = &self.peer else {
            return Ok(None);
        };
        let state = self.local.get_metadata_element_state(object).await?;
        Ok(Some(match state {
            MetadataElementState::Active => peer,
            MetadataElementState::Passive => &self.local,
        }))
    }
}
