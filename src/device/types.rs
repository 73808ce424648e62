use std::sync::{Arc, Mutex};
use log::debug;
use uuid::Uuid;

/// Identity of a peripheral as seen during discovery. The id is the
/// transport's device identity; the advertised name is what predicates
/// usually match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: String,
    pub name: Option<String>,
}

/// The (service, characteristic) pair a monitor session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Monitoring,
    Disconnecting,
    Disconnected,
}

/// One decoded heart rate measurement. `seq` counts successfully decoded
/// samples only, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub seq: u64,
}

/// The single connection state cell shared by the scanner and the connection
/// manager. All changes go through compare-and-set transitions, so racing
/// operations serialize here and the loser is rejected instead of queued.
#[derive(Clone)]
pub struct StateCell {
    inner: Arc<Mutex<ConnectionState>>,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell {
            inner: Arc::new(Mutex::new(ConnectionState::Idle)),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.inner.lock().expect("connection state lock poisoned")
    }

    /// Moves to `to` iff the current state is one of `from`. Returns the
    /// replaced state, or the current state when the transition is invalid.
    pub fn transition(
        &self,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<ConnectionState, ConnectionState> {
        let mut state = self.inner.lock().expect("connection state lock poisoned");
        if !from.contains(&*state) {
            return Err(*state);
        }

        let previous = *state;
        *state = to;
        debug!("Connection state {:?} -> {:?}", previous, to);
        Ok(previous)
    }

    /// Unconditional transition, for the paths that are valid from any state
    /// (disconnects). Returns the replaced state.
    pub fn force(&self, to: ConnectionState) -> ConnectionState {
        let mut state = self.inner.lock().expect("connection state lock poisoned");
        let previous = *state;
        *state = to;
        if previous != to {
            debug!("Connection state {:?} -> {:?}", previous, to);
        }
        previous
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_wrong_current_state() {
        let cell = StateCell::new();
        let err = cell
            .transition(&[ConnectionState::Ready], ConnectionState::Monitoring)
            .unwrap_err();
        assert_eq!(err, ConnectionState::Idle);
        assert_eq!(cell.get(), ConnectionState::Idle);
    }

    #[test]
    fn transition_applies_from_listed_state() {
        let cell = StateCell::new();
        let previous = cell
            .transition(
                &[ConnectionState::Idle, ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .unwrap();
        assert_eq!(previous, ConnectionState::Idle);
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn force_always_applies() {
        let cell = StateCell::new();
        cell.force(ConnectionState::Monitoring);
        assert_eq!(cell.force(ConnectionState::Disconnected), ConnectionState::Monitoring);
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }
}
