//! Runtime system
//!
//! This module contains the salted identifier storage, the job graph
//! scheduler and the load-once resource cache built on top of both.

pub mod cache;
pub mod identifier;
pub mod scheduler;
