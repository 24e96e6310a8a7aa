mod ledger;

pub use ledger::{AuthLedger, LedgerState, RateLimitStatus, MAX_ATTEMPTS};
