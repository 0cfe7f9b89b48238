pub mod bigquery;
pub mod contract;
pub mod dynamo;
pub mod error;
pub mod mongo;
pub mod registry;
pub mod s3db;
pub mod sql;
pub mod sqs;
pub mod webhook;
