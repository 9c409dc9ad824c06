use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::traits::CurrencyConverter;
use crate::utils::error::{AppError, Result};

/// Converts with a configured rate instead of a live lookup.
pub struct FixedRateConverter {
    rate: Option<Decimal>,
}

impl FixedRateConverter {
    pub fn new(jpy_to_eur: Option<f64>) -> Self {
        Self {
            rate: jpy_to_eur.and_then(Decimal::from_f64),
        }
    }
}

impl CurrencyConverter for FixedRateConverter {
    fn convert_jpy_to_eur(&self, amount_jpy: u64) -> Result<Decimal> {
        let rate = self
            .rate
            .ok_or_else(|| AppError::RateUnavailable("no JPY/EUR rate configured".to_string()))?;

        Ok((Decimal::from(amount_jpy) * rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}
