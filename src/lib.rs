// src/lib.rs
//
// ogen - object-storage workload generator.
//
// The pipeline: config describes a weighted operation mix; suppliers turn
// each draw into a signed HttpRequest; the driver executes them through a
// narrow client seam and publishes every completed exchange on an in-process
// bus, which couples responses back into the object population and the
// multipart session machinery.

pub mod auth;
pub mod body;
pub mod client;
pub mod conditions;
pub mod config;
pub mod driver;
pub mod events;
pub mod multipart;
pub mod objects;
pub mod request;
pub mod request_supplier;
pub mod scheduler;
pub mod size_generator;
pub mod stats;
pub mod suppliers;

pub use request::{HttpRequest, HttpResponse, Method, Operation};
