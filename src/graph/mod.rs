//! Context file dependency graph
//!
//! Files within one context form a DAG over their `depends_on` edges. Every
//! stored file carries a [`WrapFields`] record of derived properties:
//!
//! - `head`: no stored file depends on it
//! - `leaf`: none of its dependencies is stored locally
//! - `depth`: distance from the nearest head along dependent edges
//! - `covered_by_snapshot`: every dependent is a snapshot or itself covered
//!
//! Wraps are recomputed transactionally on every insertion and deletion,
//! walking from the changed file towards its dependencies.

pub mod propagate;
pub mod sanity;
pub mod wrap;

pub use propagate::{insert, local_deps, propagate, CoverageRule};
pub use sanity::check;
pub use wrap::{update, ContextFileWrap, WrapFields};
