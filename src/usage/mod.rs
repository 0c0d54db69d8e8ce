pub mod pricing;
pub mod tracker;

pub use pricing::{ModelRate, PriceBook};
pub use tracker::{
    BudgetAlert, BudgetCheck, BudgetLimits, BudgetPeriod, BudgetStatus, RequestStatus, UsageEntry,
    UsageSummary, UsageTracker,
};
