//! Document queries: a declarative spec plus a paged driver.
//!
//! Workflows describe what they want (kind, field clauses, tenant scope)
//! and let [`paged`] walk the result pages. A failure on any page fails
//! the whole query; partial results are never handed to the caller.

pub mod paged;
pub mod spec;

pub use self::paged::{collect_documents, collect_links, for_each_page};
pub use self::spec::{Clause, Occurrence, QuerySpec, DEFAULT_RESULT_LIMIT};
