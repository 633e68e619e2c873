//! fleetcast Protocol Definitions
//!
//! Messages and client stub for the module service every fleet instance exposes
//! (`proto/module.proto`), generated at build time. Messages also derive serde so
//! the HTTP surface can accept and return them as JSON.

pub mod module {
    #![allow(clippy::all)]
    #![allow(warnings)]
    tonic::include_proto!("hyperion.v1alpha1");
}

pub use module::*;
