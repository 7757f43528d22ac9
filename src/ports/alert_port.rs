//! Alert sink port trait.

use crate::domain::alert::Alert;
use crate::domain::error::CycleError;

pub trait AlertPort {
    /// Deliver one alert. Errors are recorded on the alert, never retried.
    fn deliver(&self, alert: &Alert) -> Result<(), CycleError>;
}
