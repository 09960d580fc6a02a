//! Derivation of the two ratio fields from the raw monetary quantities.
//!
//! Both the serving path (request to record) and the dataset loader (raw
//! monetary columns in a file) go through `derive_ratios`, so a ratio is
//! computed the same way everywhere it appears.

use serde::{Deserialize, Serialize};

/// The four raw monetary inputs a borrower actually reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonetaryInputs {
    pub total_unsecured_balance: f64,
    pub total_unsecured_credit_limit: f64,
    pub total_monthly_debt_payment: f64,
    pub monthly_income: f64,
}

/// Ratios fed to the model in place of the raw monetary inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedRatios {
    pub revolving_utilization: f64,
    pub debt_ratio: f64,
}

/// Balance over limit. A zero (or negative) limit yields exactly `0.0`.
#[inline]
pub fn revolving_utilization(balance: f64, limit: f64) -> f64 {
    if limit > 0.0 { balance / limit } else { 0.0 }
}

/// Monthly debt payment over monthly income. Without positive income the
/// payment itself is returned.
#[inline]
pub fn debt_ratio(monthly_debt_payment: f64, monthly_income: f64) -> f64 {
    if monthly_income > 0.0 {
        monthly_debt_payment / monthly_income
    } else {
        monthly_debt_payment
    }
}

pub fn derive_ratios(inputs: &MonetaryInputs) -> DerivedRatios {
    DerivedRatios {
        revolving_utilization: revolving_utilization(
            inputs.total_unsecured_balance,
            inputs.total_unsecured_credit_limit,
        ),
        debt_ratio: debt_ratio(inputs.total_monthly_debt_payment, inputs.monthly_income),
    }
}
