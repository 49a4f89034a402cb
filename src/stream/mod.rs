//! Range negotiation and chunked upstream fetching

pub mod fetch;
pub mod range;

pub use fetch::{FetchCoordinator, FetchStream};
pub use range::{negotiate, ResponseFraming};
