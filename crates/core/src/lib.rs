pub mod config;
pub mod error;
pub mod identity;
pub mod store;
pub mod quota;
pub mod policy;
pub mod job;
pub mod transient;
pub mod encoder;
pub mod admission;
pub mod engine;
pub mod sweeper;
pub mod context;
pub mod intake;
pub mod commands;
pub mod snapshot;

pub use config::ServiceConfig;
pub use context::{ServiceContext, ServiceStats};
pub use error::{AdmissionError, ConversionError, StorageError};
pub use identity::Identity;
pub use job::{Job, JobId, JobState};
pub use engine::OutputHandle;
pub use snapshot::Snapshot;
