//! Built-in pipeline behaviors

mod inbox;
mod leader;
mod logging;
mod retry;
mod validation;

pub use inbox::InboxBehavior;
pub use leader::{ForwardToLeaderBehavior, LeaderOnlyBehavior};
pub use logging::LoggingBehavior;
pub use retry::{RetryBehavior, RetryPolicy};
pub use validation::{Validate, ValidationBehavior};
