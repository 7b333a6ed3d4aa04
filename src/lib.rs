pub mod artifact;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod recipe;
pub mod scheduler;
pub mod steps;
pub mod table;
pub mod transform;
pub mod validation;

pub use error::{PipelineError, StepResult};
pub use pipeline::{PipelineExecutor, PipelineResult};
pub use recipe::Recipe;
