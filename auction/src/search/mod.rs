//! Search read model.
//!
//! A denormalized copy of every auction, kept up to date by
//! [`SearchProjection`] from the `search` queue and seeded at startup by
//! [`CatchUp`]. Both paths go through [`apply_change`], so a stale event can
//! never overwrite a newer row regardless of arrival order.

pub mod catch_up;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod projection;
pub mod query;
pub mod store;

pub use catch_up::{CatchUp, CatchUpError};
pub use memory::InMemorySearchStore;
pub use model::SearchItem;
pub use postgres::PostgresSearchStore;
pub use projection::{ItemRules, SearchProjection};
pub use query::{FilterBy, OrderBy, SearchPage, SearchQuery};
pub use store::{ApplyOutcome, SearchChange, SearchError, SearchStore, apply_change};
