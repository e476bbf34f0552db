//! Client lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// The full internal lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    /// Created but never started.
    Initial = 0,
    /// The `initialize` handshake is in progress.
    Starting = 1,
    /// Handshake complete; features may issue requests.
    Running = 2,
    /// `stop` is tearing the connection down.
    Stopping = 3,
    /// Stopped, either deliberately or after a denied restart.
    Stopped = 4,
    /// `initialize` failed and no retry was requested.
    StartFailed = 5,
}

/// The coarse lifecycle state exposed to hosts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublicState {
    /// Not serving requests.
    Stopped,
    /// The handshake is in progress.
    Starting,
    /// Fully operational.
    Running,
}

/// Lock-free cell holding the current [`State`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        StateCell(AtomicU8::new(State::Initial as u8))
    }

    pub fn get(&self) -> State {
        match self.0.load(Ordering::SeqCst) {
            0 => State::Initial,
            1 => State::Starting,
            2 => State::Running,
            3 => State::Stopping,
            4 => State::Stopped,
            _ => State::StartFailed,
        }
    }

    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn public(&self) -> PublicState {
        match self.get() {
            State::Starting => PublicState::Starting,
            State::Running => PublicState::Running,
            _ => PublicState::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_state() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), State::Initial);

        for state in [
            State::Starting,
            State::Running,
            State::Stopping,
            State::Stopped,
            State::StartFailed,
            State::Initial,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn public_state_is_coarse() {
        let cell = StateCell::new();
        assert_eq!(cell.public(), PublicState::Stopped);

        cell.set(State::Starting);
        assert_eq!(cell.public(), PublicState::Starting);

        cell.set(State::Running);
        assert_eq!(cell.public(), PublicState::Running);

        cell.set(State::Stopping);
        assert_eq!(cell.public(), PublicState::Stopped);

        cell.set(State::StartFailed);
        assert_eq!(cell.public(), PublicState::Stopped);
    }
}
