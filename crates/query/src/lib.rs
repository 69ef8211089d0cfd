//! The request-handling layer over a `table::Table`: insert, select (current
//! and historical), update, delete, range-sum, and increment.

mod query;
mod record;

pub use query::Query;
pub use record::Record;
