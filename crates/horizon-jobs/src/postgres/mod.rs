//! PostgreSQL backend.
//!
//! Every lease comparison uses the database clock (`NOW()`), so workers on
//! different hosts agree on expiry regardless of local clock skew.

mod dead_letter_store;
mod exclusive_store;
mod job_store;
mod notifier;
mod pool;
mod template_store;

pub use dead_letter_store::PgDeadLetterStore;
pub use exclusive_store::PgExclusiveRunStore;
pub use job_store::PgJobStore;
pub use notifier::PgCancellationNotifier;
pub use pool::{create_pool, DatabasePool};
pub use template_store::{PgItemStore, PgTemplateStore};
