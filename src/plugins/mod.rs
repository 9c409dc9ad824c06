pub mod currency;
pub mod notifiers;
pub mod traits;

pub use currency::FixedRateConverter;
pub use notifiers::TelegramNotifier;
pub use traits::{CurrencyConverter, ListingSource, NotifierPlugin};
