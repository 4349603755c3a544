use crate::protocol::ViewerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlDecision {
    Granted,
    /// The requester already held control.
    AlreadyHeld,
    Denied { holder: ViewerId },
}

/// Exclusive input control among the viewers of one relay session.
///
/// First requester wins; control only changes hands through an explicit
/// release or the controller disconnecting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlArbiter {
    controller: Option<ViewerId>,
}

impl ControlArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controller(&self) -> Option<ViewerId> {
        self.controller
    }

    pub fn has_control(&self, viewer: ViewerId) -> bool {
        self.controller == Some(viewer)
    }

    pub fn request_control(&mut self, viewer: ViewerId) -> ControlDecision {
        match self.controller {
            None => {
                self.controller = Some(viewer);
                ControlDecision::Granted
            }
            Some(holder) if holder == viewer => ControlDecision::AlreadyHeld,
            Some(holder) => ControlDecision::Denied { holder },
        }
    }

    /// No-op unless `viewer` is the controller. Returns true when control changed.
    pub fn release_control(&mut self, viewer: ViewerId) -> bool {
        if self.has_control(viewer) {
            self.controller = None;
            true
        } else {
            false
        }
    }

    pub fn viewer_disconnected(&mut self, viewer: ViewerId) -> bool {
        self.release_control(viewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_requester_wins_and_second_is_denied() {
        let mut arbiter = ControlArbiter::new();
        assert_eq!(arbiter.request_control(1), ControlDecision::Granted);
        assert_eq!(arbiter.request_control(2), ControlDecision::Denied { holder: 1 });
        assert_eq!(arbiter.request_control(1), ControlDecision::AlreadyHeld);
        assert!(arbiter.has_control(1));
        assert!(!arbiter.has_control(2));
    }

    #[test]
    fn release_by_non_controller_is_a_no_op() {
        let mut arbiter = ControlArbiter::new();
        arbiter.request_control(1);
        assert!(!arbiter.release_control(2));
        assert_eq!(arbiter.controller(), Some(1));
        assert!(arbiter.release_control(1));
        assert_eq!(arbiter.controller(), None);
        assert_eq!(arbiter.request_control(2), ControlDecision::Granted);
    }

    #[test]
    fn controller_disconnect_clears_control() {
        let mut arbiter = ControlArbiter::new();
        arbiter.request_control(3);
        assert!(!arbiter.viewer_disconnected(4));
        assert!(arbiter.viewer_disconnected(3));
        assert_eq!(arbiter.controller(), None);
    }
}
