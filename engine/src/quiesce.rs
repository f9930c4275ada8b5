// Copyright 2023 Oxide Computer Company
use sep_common::ClusteredFlags;

/// Per-object quiesce state
///
/// Requests only record intent.  The transition itself is taken by
/// [`QuiesceState::on_cycle`] at the next monitor cycle boundary, after any
/// chunk already in flight has finished.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum QuiesceState {
    #[default]
    Active,
    QuiesceRequested,
    Quiesced,
    UnquiesceRequested,
}

impl QuiesceState {
    pub fn request_quiesce(self) -> Self {
        match self {
            QuiesceState::Active => QuiesceState::QuiesceRequested,
            // Still holding I/O, so there is nothing to wait for.
            QuiesceState::UnquiesceRequested => QuiesceState::Quiesced,
            s => s,
        }
    }

    pub fn request_unquiesce(self) -> Self {
        match self {
            QuiesceState::Quiesced => QuiesceState::UnquiesceRequested,
            QuiesceState::QuiesceRequested => QuiesceState::Active,
            s => s,
        }
    }

    /// Take any pending transition
    pub fn on_cycle(self) -> Self {
        match self {
            QuiesceState::QuiesceRequested => QuiesceState::Quiesced,
            QuiesceState::UnquiesceRequested => QuiesceState::Active,
            s => s,
        }
    }

    pub fn flags(self) -> ClusteredFlags {
        match self {
            QuiesceState::Active => ClusteredFlags::empty(),
            QuiesceState::QuiesceRequested => ClusteredFlags::QUIESCING,
            QuiesceState::Quiesced => ClusteredFlags::QUIESCED,
            QuiesceState::UnquiesceRequested => {
                ClusteredFlags::QUIESCED | ClusteredFlags::UNQUIESCING
            }
        }
    }

    /// Background operations only run when fully active
    pub fn allows_background(self) -> bool {
        self == QuiesceState::Active
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quiesce_then_unquiesce() {
        let s = QuiesceState::default().request_quiesce();
        assert_eq!(s.flags(), ClusteredFlags::QUIESCING);
        assert!(!s.allows_background());

        let s = s.on_cycle();
        assert_eq!(s, QuiesceState::Quiesced);
        assert!(s.flags().contains(ClusteredFlags::QUIESCED));

        let s = s.request_unquiesce();
        assert!(s.flags().contains(ClusteredFlags::UNQUIESCING));
        let s = s.on_cycle();
        assert_eq!(s, QuiesceState::Active);
        assert!(s.flags().is_empty());
        assert!(s.allows_background());
    }

    #[test]
    fn repeated_requests_are_noops() {
        let q = QuiesceState::Quiesced;
        assert_eq!(q.request_quiesce(), q);
        assert_eq!(q.request_quiesce().flags(), ClusteredFlags::QUIESCED);

        let r = QuiesceState::QuiesceRequested;
        assert_eq!(r.request_quiesce(), r);

        let a = QuiesceState::Active;
        assert_eq!(a.request_unquiesce(), a);
        let u = QuiesceState::UnquiesceRequested;
        assert_eq!(u.request_unquiesce(), u);
    }

    #[test]
    fn requests_cancel_each_other() {
        assert_eq!(
            QuiesceState::QuiesceRequested.request_unquiesce(),
            QuiesceState::Active
        );
        assert_eq!(
            QuiesceState::UnquiesceRequested.request_quiesce(),
            QuiesceState::Quiesced
        );
    }

    #[test]
    fn idle_states_survive_cycles() {
        for s in [QuiesceState::Active, QuiesceState::Quiesced] {
            assert_eq!(s.on_cycle(), s);
        }
    }
}
