pub mod context;
pub mod job;
pub mod registry;
pub mod repository;
pub mod scope;
pub mod step;

pub use context::ExecutionContext;
pub use job::{JobExecution, JobExecutionSnapshot, JobInstance, JobParameters};
pub use registry::{JobExecutionRegistry, JobIdentifier};
pub use repository::{InMemoryJobRepository, JobRepository};
pub use scope::{ChunkContext, JobExecutionContext, StepContext};
pub use step::{StepContribution, StepExecution};
