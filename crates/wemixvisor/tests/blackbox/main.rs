#![expect(
    clippy::missing_panics_doc,
    reason = "clippy lints that are not ok in production code but acceptable or wanted in tests"
)]

pub mod helpers;
pub mod rollback;
pub mod scheduling;
pub mod shutdown;
pub mod upgrade_flow;
