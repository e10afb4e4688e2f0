//! high-level operations on verstash repositories

mod checkout;
pub(crate) mod commit;
mod diff;
mod list;
mod repair;
mod status;

pub use checkout::{checkout, CheckoutOptions, CheckoutSummary};
pub use commit::{commit, CommitOptions, CommitOutcome, CommitSummary};
pub use diff::{diff, diff_commits, DiffResult};
pub use list::{latest, list, show};
pub use repair::repair;
pub use status::{status, StatusOptions, StatusReport};
