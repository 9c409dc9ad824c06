pub mod currency;
pub mod listing_source;
pub mod notifier;

pub use currency::CurrencyConverter;
pub use listing_source::{ListingSource, PageSnapshot, SourceError, SourceErrorKind};
pub use notifier::{NotificationReceipt, NotifierPlugin, OutboundMessage};
