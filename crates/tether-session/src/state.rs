//! Monotone lifecycle state shared between a connector (or acceptor) and
//! its communicator.

use std::sync::Mutex;

use tether_wire::SessionState;

use crate::errors::CommError;

fn rank(state: SessionState) -> u8 {
    match state {
        SessionState::None => 0,
        SessionState::Opening => 1,
        SessionState::Open => 2,
        SessionState::Closing => 3,
        SessionState::Closed => 4,
    }
}

/// A lifecycle cell: NONE → OPENING → OPEN → CLOSING → CLOSED, forward only.
///
/// One cell describes one lifecycle. Components that allow re-opening
/// (servers) construct a fresh cell per lifecycle instead of rewinding.
#[derive(Debug)]
pub struct StateCell {
    current: Mutex<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(SessionState::None),
        }
    }

    pub fn get(&self) -> SessionState {
        *lock(&self.current)
    }

    /// Take the NONE → OPENING transition, the only legal entry into a
    /// lifecycle.
    pub fn begin_open(&self) -> Result<(), CommError> {
        let mut current = lock(&self.current);
        match *current {
            SessionState::None => {
                *current = SessionState::Opening;
                Ok(())
            }
            state => Err(CommError::AlreadyOpen { state }),
        }
    }

    /// Take the OPEN → CLOSING transition; every other source state is a
    /// `NotReady` error (including a second close).
    pub fn begin_close(&self) -> Result<(), CommError> {
        let mut current = lock(&self.current);
        match *current {
            SessionState::Open => {
                *current = SessionState::Closing;
                Ok(())
            }
            state => Err(CommError::NotReady { state }),
        }
    }

    /// Move forward to `target`; backward transitions are ignored, so no
    /// interleaving can make the observable state regress.
    pub fn advance_to(&self, target: SessionState) {
        let mut current = lock(&self.current);
        if rank(target) > rank(*current) {
            *current = target;
        }
    }

    pub fn require_open(&self) -> Result<(), CommError> {
        match self.get() {
            SessionState::Open => Ok(()),
            state => Err(CommError::NotReady { state }),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Poison-tolerant mutex access: lifecycle state stays usable even if a
/// holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_walks_forward() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::None);
        cell.begin_open().expect("open from NONE");
        assert_eq!(cell.get(), SessionState::Opening);
        cell.advance_to(SessionState::Open);
        cell.begin_close().expect("close from OPEN");
        assert_eq!(cell.get(), SessionState::Closing);
        cell.advance_to(SessionState::Closed);
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn state_never_regresses() {
        let cell = StateCell::new();
        cell.advance_to(SessionState::Open);
        cell.advance_to(SessionState::Opening);
        assert_eq!(cell.get(), SessionState::Open);
        cell.advance_to(SessionState::Closed);
        cell.advance_to(SessionState::None);
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn reopen_and_double_close_are_typed_errors() {
        let cell = StateCell::new();
        cell.begin_open().unwrap();
        assert!(matches!(
            cell.begin_open(),
            Err(CommError::AlreadyOpen {
                state: SessionState::Opening
            })
        ));

        assert!(matches!(
            cell.begin_close(),
            Err(CommError::NotReady {
                state: SessionState::Opening
            })
        ));

        cell.advance_to(SessionState::Open);
        cell.begin_close().unwrap();
        assert!(matches!(
            cell.begin_close(),
            Err(CommError::NotReady {
                state: SessionState::Closing
            })
        ));
        cell.advance_to(SessionState::Closed);
        assert!(matches!(
            cell.begin_close(),
            Err(CommError::NotReady {
                state: SessionState::Closed
            })
        ));
    }

    #[test]
    fn require_open_reports_the_offending_state() {
        let cell = StateCell::new();
        assert!(matches!(
            cell.require_open(),
            Err(CommError::NotReady {
                state: SessionState::None
            })
        ));
        cell.advance_to(SessionState::Open);
        assert!(cell.require_open().is_ok());
    }
}
