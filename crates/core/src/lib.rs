//! Core crate for the framebridge frame-inference bridge.

pub mod backend;
pub mod capability;
pub mod config;
pub mod controller;
pub mod device_catalog;
pub mod error;
pub mod frame_adapter;
pub mod logging;
pub mod model_catalog;
pub mod ort_backend;
pub mod runtime;
pub mod session;
pub mod types;
