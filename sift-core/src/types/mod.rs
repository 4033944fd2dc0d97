pub mod filter;
pub mod ids;
pub mod job;

pub use filter::SweepFilter;
pub use ids::{DocumentId, EntityId, JobId, WorkerId};
pub use job::{SweepJob, SweepRequest};
