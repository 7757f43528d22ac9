//! Domain error types.

/// A parse error with position information for rule parsing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Top-level error type for cyclewatch.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("data quality issue for {instrument}: {reason}")]
    DataQuality { instrument: String, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("stale {level} cycle for {instrument}: {elapsed} bars elapsed, window max {max}")]
    StaleCycle {
        instrument: String,
        level: String,
        elapsed: usize,
        max: usize,
    },

    #[error("constraint violation: rule {rule} recommends {instrument} in account {account}")]
    ConstraintViolation {
        rule: String,
        instrument: String,
        account: String,
    },

    #[error(transparent)]
    RuleParse(#[from] ParseError),

    #[error("invalid rule {rule}: {reason}")]
    RuleInvalid { rule: String, reason: String },

    #[error("bar feed error: {reason}")]
    Feed { reason: String },

    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CycleError {
    /// True for the configuration family; these make a rule or level fail closed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CycleError::ConfigParse { .. }
                | CycleError::ConfigMissing { .. }
                | CycleError::ConfigInvalid { .. }
                | CycleError::RuleInvalid { .. }
        )
    }
}

impl From<&CycleError> for std::process::ExitCode {
    fn from(err: &CycleError) -> Self {
        let code: u8 = match err {
            CycleError::Io(_) => 1,
            CycleError::ConfigParse { .. }
            | CycleError::ConfigMissing { .. }
            | CycleError::ConfigInvalid { .. } => 2,
            CycleError::Persistence { .. } => 3,
            CycleError::RuleParse(_) | CycleError::RuleInvalid { .. } => 4,
            CycleError::DataQuality { .. }
            | CycleError::Feed { .. }
            | CycleError::StaleCycle { .. }
            | CycleError::ConstraintViolation { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
