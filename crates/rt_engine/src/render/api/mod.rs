//! Backend-facing API types
//!
//! The frame core never talks to a graphics API directly; everything goes
//! through the [`DeviceBackend`] trait defined here.

pub mod device_backend;

pub use device_backend::{
    AcquireOutcome, DeviceBackend, DeviceError, DeviceResult, PresentOutcome, PresentRequest,
    QueueKind, SubmitRequest, SwapchainDesc,
};
