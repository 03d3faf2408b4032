pub mod admission;
pub mod auth;
pub mod credits;
pub mod error;
pub mod limiter;
pub mod plans;
pub mod validate;

pub use admission::{Admission, AdmissionConfig, Submission};
pub use auth::{ApiKeyResolver, Principal};
pub use credits::{CreditLedger, LedgerError, MemoryCreditLedger, PgCreditLedger};
pub use error::AdmissionError;
pub use limiter::{DenyReason, OperationType, RateDecision, RateLimiter};
pub use plans::{Plan, PlanCache, PlanError, PlanProvider, StaticPlanProvider};
pub use validate::{validate_request, RequestLimits, ValidationError};
