//! gRPC transport for module instance calls

pub mod client;

pub use client::{GrpcCallerConfig, GrpcModuleCaller};
