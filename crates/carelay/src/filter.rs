// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Regex PV filter applied to CA search requests.
//!
//! A filter is an ordered list of compiled regular expressions plus two
//! switches controlling how per-rule verdicts combine:
//!
//! - `sense` inverts every rule's individual verdict (`hit = match XOR sense`),
//!   turning an allow-list into a deny-list.
//! - `logic` selects the combination: `false` = OR (first positive hit
//!   accepts), `true` = AND (every rule must hit).
//!
//! An empty rule list accepts everything.

use regex::Regex;

/// Compiled PV filter. Rules are evaluated in configuration order.
#[derive(Debug)]
pub struct PvFilter {
    /// Invert each rule's match verdict.
    pub sense: bool,
    /// `false` = OR combination, `true` = AND combination.
    pub logic: bool,
    rules: Vec<Regex>,
}

impl PvFilter {
    /// Compile a filter from raw rule strings.
    ///
    /// Compilation failures are fatal: the caller reports them as
    /// configuration errors before any socket is opened.
    pub fn compile(sense: bool, logic: bool, rules: &[String]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|r| Regex::new(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            sense,
            logic,
            rules,
        })
    }

    /// Filter that accepts every PV name.
    pub fn accept_all() -> Self {
        Self {
            sense: false,
            logic: false,
            rules: Vec::new(),
        }
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide whether a PV name passes the filter.
    ///
    /// OR mode returns on the first positive hit and rejects once the rule
    /// list is exhausted; AND mode returns on the first negative hit and
    /// accepts once the rule list is exhausted.
    pub fn matches(&self, pv: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }

        for rule in &self.rules {
            let hit = rule.is_match(pv) ^ self.sense;
            if self.logic {
                // AND: any miss is decisive
                if !hit {
                    return false;
                }
            } else {
                // OR: any hit is decisive
                if hit {
                    return true;
                }
            }
        }

        self.logic
    }
}
