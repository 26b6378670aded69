//! SeaORM entities for the relational backends
//!
//! Columns the backend filters, orders or compares on are stored natively;
//! the full record lives in `document` as JSON. Instants that take part in
//! comparisons are epoch milliseconds so every dialect agrees on equality.

pub mod jobs;
pub mod prelude;
pub mod schedules;
