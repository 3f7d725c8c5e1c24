pub mod api;
pub mod models;
pub mod state;

pub use models::{
    EntitlementTier, GenerationJob, JobState, JobUpdate, NewGenerationJob, Resolution,
};
pub use state::{plan_transition, Transition};
