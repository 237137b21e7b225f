//! # RT Engine
//!
//! A frame-pipelined, ray-tracing oriented render engine consumed as a
//! library by a host application. The host owns the window and the scene;
//! the engine owns frame pacing: command pools and submission across three
//! queue families, the StartFrame/DrawFrame contract, and the lifecycle of
//! one or two presentation swapchains.
//!
//! All device work flows through the [`render::api::DeviceBackend`] trait,
//! so the full frame loop also runs on the recording
//! [`render::backends::headless::HeadlessBackend`] with no GPU present.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rt_engine::prelude::*;
//!
//! fn main() -> Result<(), EngineError> {
//!     let (backend, surface) = HeadlessBackend::with_surface(1280, 720);
//!     let mut engine = Engine::with_backend(
//!         Box::new(backend),
//!         EngineSurfaces { primary: surface, overlay: None },
//!         EngineSettings::default(),
//!         None,
//!     )?;
//!
//!     for _ in 0..3 {
//!         engine.start_frame(&StartFrameInfo::default())?;
//!         // Record ray dispatches into engine.frame_cmd() here.
//!         engine.draw_frame(&DrawFrameInfo::default())?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod engine;
pub mod frame;
pub mod logging;
pub mod msg;
pub mod render;

pub use engine::{
    DrawFrameInfo, Engine, EngineCreateInfo, EngineError, EngineResult, EngineSurfaces,
    StartFrameInfo, WindowHandles,
};
pub use frame::MAX_FRAMES_IN_FLIGHT;

/// Commonly used types for hosts embedding the engine.
pub mod prelude {
    pub use crate::config::{Config, ConfigError, EngineSettings};
    pub use crate::engine::{
        DrawFrameInfo, Engine, EngineCreateInfo, EngineError, EngineResult, EngineSurfaces,
        PresentBlit, StartFrameInfo, WindowHandles,
    };
    pub use crate::frame::MAX_FRAMES_IN_FLIGHT;
    pub use crate::msg::{MessageCallback, MessageSeverity};
    pub use crate::render::api::{
        AcquireOutcome, DeviceBackend, DeviceError, DeviceResult, PresentOutcome, QueueKind,
    };
    pub use crate::render::backends::headless::HeadlessBackend;
    pub use crate::render::swapchain::{SubscriberKey, SwapchainProperties, SwapchainSubscriber};
    pub use crate::render::sync::{ToSignal, ToWait};
}
