//! Token accounting for the scout and main planners.

use crate::config::Pricing;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;
    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerRole {
    Scout,
    Main,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleCost {
    pub tokens: TokenUsage,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub model: String,
    pub scout: RoleCost,
    pub main: RoleCost,
    pub total: RoleCost,
}

impl TokenSummary {
    pub fn merge(&mut self, other: &TokenSummary) {
        if self.model.is_empty() {
            self.model = other.model.clone();
        }
        for (mine, theirs) in [
            (&mut self.scout, &other.scout),
            (&mut self.main, &other.main),
            (&mut self.total, &other.total),
        ] {
            mine.tokens += theirs.tokens;
            mine.cost += theirs.cost;
        }
    }
}

/// Usage for one work item, split by planner role.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    scout: TokenUsage,
    main: TokenUsage,
}

impl TokenLedger {
    pub fn add(&mut self, role: PlannerRole, usage: TokenUsage) {
        match role {
            PlannerRole::Scout => self.scout += usage,
            PlannerRole::Main => self.main += usage,
        }
    }

    pub fn summary(&self, model: &str, pricing: &Pricing) -> TokenSummary {
        let price = pricing.price_for(model);
        let cost = |u: TokenUsage| {
            (u.input as f64 / 1_000_000.0) * price.input + (u.output as f64 / 1_000_000.0) * price.output
        };
        let scout = RoleCost {
            tokens: self.scout,
            cost: cost(self.scout),
        };
        let main = RoleCost {
            tokens: self.main,
            cost: cost(self.main),
        };
        TokenSummary {
            model: model.to_string(),
            scout,
            main,
            total: RoleCost {
                tokens: self.scout + self.main,
                cost: scout.cost + main.cost,
            },
        }
    }
}
