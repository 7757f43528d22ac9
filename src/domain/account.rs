//! Read-only position/account inputs and externally supplied flags.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub id: String,
    pub tax_advantaged: bool,
    /// Units held per instrument.
    pub holdings: BTreeMap<String, f64>,
    pub disallowed: BTreeSet<String>,
}

impl AccountState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn position(&self, instrument: &str) -> f64 {
        self.holdings.get(instrument).copied().unwrap_or(0.0)
    }

    pub fn allows(&self, instrument: &str) -> bool {
        !self.disallowed.contains(instrument)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub accounts: BTreeMap<String, AccountState>,
}

impl PortfolioSnapshot {
    pub fn new(accounts: Vec<AccountState>) -> Self {
        Self {
            accounts: accounts.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    pub fn account(&self, id: &str) -> Option<&AccountState> {
        self.accounts.get(id)
    }

    /// Units of `instrument` held across every account.
    pub fn total_position(&self, instrument: &str) -> f64 {
        self.accounts.values().map(|a| a.position(instrument)).sum()
    }
}

/// Named boolean inputs decided outside the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalFlags {
    values: BTreeMap<String, bool>,
}

impl ExternalFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: bool) {
        self.values.insert(name.to_lowercase(), value);
    }

    pub fn with(mut self, name: &str, value: bool) -> Self {
        self.set(name, value);
        self
    }

    /// `None` when the flag was not supplied.
    pub fn get(&self, name: &str) -> Option<bool> {
        self.values.get(&name.to_lowercase()).copied()
    }

    /// Parse `name=true,other=false`.
    pub fn parse_list(input: &str) -> Result<Self, String> {
        let mut flags = Self::new();
        for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = item
                .split_once('=')
                .ok_or_else(|| format!("expected name=value, found '{}'", item))?;
            let value = match value.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                other => return Err(format!("invalid flag value '{}' for {}", other, name)),
            };
            flags.set(name.trim(), value);
        }
        Ok(flags)
    }

    pub fn merge(&mut self, other: &ExternalFlags) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
