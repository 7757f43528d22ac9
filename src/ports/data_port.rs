//! Bar feed port trait.

use crate::domain::error::CycleError;
use crate::domain::ohlcv::OhlcvBar;
use chrono::NaiveDateTime;

pub trait DataPort {
    /// Finalized bars for `instrument` strictly after `after`, oldest first.
    /// `None` returns the full history.
    fn fetch_bars(
        &self,
        instrument: &str,
        after: Option<NaiveDateTime>,
    ) -> Result<Vec<OhlcvBar>, CycleError>;

    fn list_instruments(&self) -> Result<Vec<String>, CycleError>;
}
