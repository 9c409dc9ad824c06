use rust_decimal::Decimal;

use crate::utils::error::Result;

/// JPY to EUR conversion; fails with `AppError::RateUnavailable`.
#[cfg_attr(test, mockall::automock)]
pub trait CurrencyConverter: Send + Sync {
    fn convert_jpy_to_eur(&self, amount_jpy: u64) -> Result<Decimal>;
}
