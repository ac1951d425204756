//! Budget ledger value objects.
//!
//! Costs are tracked as integer micro-dollars so concurrent debits never
//! accumulate floating point drift.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use uuid::Uuid;

/// A metered amount in micro-dollars (1 dollar = 1_000_000)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);
    const MICROS_PER_DOLLAR: u64 = 1_000_000;

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_cents(cents: u64) -> Self {
        Self(cents * 10_000)
    }

    /// Convert a dollar amount, clamping negative and non-finite values to zero
    pub fn from_dollars(dollars: f64) -> Self {
        if !dollars.is_finite() || dollars <= 0.0 {
            return Self::ZERO;
        }
        Self((dollars * Self::MICROS_PER_DOLLAR as f64).round() as u64)
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    pub fn as_dollars(&self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_DOLLAR as f64
    }

    pub fn checked_add(self, other: Cost) -> Option<Cost> {
        self.0.checked_add(other.0).map(Cost)
    }

    pub fn saturating_add(self, other: Cost) -> Cost {
        Cost(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Cost) -> Cost {
        Cost(self.0.saturating_sub(other.0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        self.saturating_add(rhs)
    }
}

impl std::iter::Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Cost::saturating_add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.4}", self.as_dollars())
    }
}

/// Which ceiling a budget decision refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Execution,
    Project,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Project => write!(f, "project"),
        }
    }
}

/// Hard ceilings applied when an execution is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCeilings {
    pub execution: Cost,
    pub project: Cost,
}

/// Spend accounting for one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLedger {
    pub spent: Cost,
    pub reserved: Cost,
    pub ceiling: Cost,
}

impl ScopeLedger {
    pub fn remaining(&self) -> Cost {
        self.ceiling.saturating_sub(self.spent)
    }

    /// Whether admitting `amount` on top of spend and outstanding reservations
    /// stays under the ceiling
    pub fn can_reserve(&self, amount: Cost) -> bool {
        self.spent
            .checked_add(self.reserved)
            .and_then(|committed| committed.checked_add(amount))
            .is_some_and(|total| total <= self.ceiling)
    }

    /// Whether debiting `amount` keeps `spent <= ceiling`
    pub fn can_debit(&self, amount: Cost) -> bool {
        self.spent
            .checked_add(amount)
            .is_some_and(|total| total <= self.ceiling)
    }
}

/// Point-in-time view of both ledgers for an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub execution_uuid: Uuid,
    pub project_uuid: Uuid,
    pub execution: ScopeLedger,
    pub project: ScopeLedger,
}

/// Idempotency key for a single agent invocation's charge.
///
/// One key per dispatch: a retried task gets a fresh invocation id, so a
/// replayed commit of the same attempt can never double-charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargeKey(pub Uuid);

impl fmt::Display for ChargeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a pre-dispatch reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BudgetDecision {
    Admitted,
    Rejected {
        scope: BudgetScope,
        requested: Cost,
        spent: Cost,
        reserved: Cost,
        ceiling: Cost,
    },
}

impl BudgetDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Result of committing an invocation's actual cost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Committed {
        execution_spent: Cost,
        project_spent: Cost,
    },
    /// The key was already committed; nothing was charged again
    AlreadyCommitted,
    /// The debit would break a ceiling; nothing was charged
    Rejected {
        scope: BudgetScope,
        attempted: Cost,
        spent: Cost,
        ceiling: Cost,
    },
}

impl ChargeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::AlreadyCommitted)
    }
}
