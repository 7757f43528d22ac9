//! State persistence port trait.

use crate::domain::error::CycleError;
use crate::domain::state_store::{StateSnapshot, TransitionRecord};

pub trait PersistencePort {
    /// The last committed snapshot, if one was ever written.
    fn read_last_state(&self) -> Result<Option<StateSnapshot>, CycleError>;

    fn append_transition(&self, record: &TransitionRecord) -> Result<(), CycleError>;

    fn overwrite_current_state(&self, snapshot: &StateSnapshot) -> Result<(), CycleError>;

    fn read_transitions(&self, limit: usize) -> Result<Vec<TransitionRecord>, CycleError>;
}
