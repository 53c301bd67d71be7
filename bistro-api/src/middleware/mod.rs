pub mod auth;
pub mod rate_limit;

pub use auth::{authenticate, Authorized, Claims};
pub use rate_limit::limit_payments;
