#![doc = "The `taskhub` library crate."]
#![doc = ""]
#![doc = "Session handling (token codec, revocation store, request gate), the task assignment"]
#![doc = "reconciliation engine, the persistence seams behind them and the HTTP routes."]
#![doc = "The binary (`main.rs`) wires these together and runs the server."]

pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod shutdown;
pub mod store;
pub mod tasks;

pub use crate::error::AppError;
pub use crate::shutdown::Cancellation;
pub use crate::tasks::{Reconciliation, TaskService};
