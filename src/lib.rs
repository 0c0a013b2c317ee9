//! Process supervisor: runs a set of registered services, keeps a bounded
//! log of their output and streams new lines to live subscribers.

pub mod control;
pub mod error;
pub mod log_buffer;
pub mod logger;
pub mod parse;
pub mod runtime;
pub mod shell;
pub mod subscribers;

pub use control::{BulkReport, Supervisor, Target};
pub use error::{AggregateError, SupervisorError};
pub use log_buffer::LogBuffer;
pub use parse::{Config, ConfigSource, ServiceConfig};
pub use runtime::{ProcessRecord, ServiceStatus};
pub use subscribers::{DeliveryError, LogSink, SubscriberId, SubscriberSet};
