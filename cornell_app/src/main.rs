//! Cornell box demo application
//!
//! Thin host around the engine: it owns the windows and the event loop,
//! the engine owns frame pacing and presentation. Settings are read from
//! `cornell.toml` in the working directory when present. Press V to
//! toggle vsync, Escape to quit.

use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use rt_engine::prelude::*;
use winit::{
    dpi::LogicalSize,
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::{Window, WindowBuilder},
};

const SETTINGS_FILE: &str = "cornell.toml";

fn load_settings() -> EngineSettings {
    match EngineSettings::load_from_file(SETTINGS_FILE) {
        Ok(settings) => {
            log::info!("Loaded settings from {SETTINGS_FILE}");
            settings
        }
        Err(ConfigError::Io(_)) => {
            log::info!("No {SETTINGS_FILE} found, using defaults");
            EngineSettings::default()
        }
        Err(e) => {
            log::warn!("Ignoring malformed {SETTINGS_FILE}: {e}");
            EngineSettings::default()
        }
    }
}

fn handles_for(window: &Window) -> WindowHandles {
    WindowHandles {
        display: window.raw_display_handle(),
        window: window.raw_window_handle(),
    }
}

fn run_frame(engine: &mut Engine, vsync: bool) -> EngineResult<()> {
    engine.start_frame(&StartFrameInfo { vsync })?;
    // The scene and its ray dispatches belong to the game; this demo
    // drives pacing and presentation with an otherwise empty frame.
    engine.draw_frame(&DrawFrameInfo::default())
}

fn main() {
    rt_engine::logging::init();

    log::info!("Starting Cornell demo");
    let settings = load_settings();

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title(&settings.app_name)
        .with_inner_size(LogicalSize::new(1280.0, 720.0))
        .build(&event_loop)
        .expect("Failed to create the main window");
    let overlay_window = if settings.debug_overlay {
        let overlay = WindowBuilder::new()
            .with_title(format!("{} overlay", settings.app_name))
            .with_inner_size(LogicalSize::new(640.0, 360.0))
            .build(&event_loop)
            .expect("Failed to create the overlay window");
        Some(overlay)
    } else {
        None
    };

    let mut vsync = settings.vsync;
    let engine = Engine::new(EngineCreateInfo {
        settings,
        window: handles_for(&window),
        overlay_window: overlay_window.as_ref().map(handles_for),
        message_callback: Some(Box::new(|severity, text| {
            if severity.intersects(MessageSeverity::WARNING | MessageSeverity::ERROR) {
                eprintln!("[engine] {text}");
            }
        })),
    });
    let mut engine = match engine {
        Ok(engine) => Some(engine),
        Err(e) => {
            log::error!("Engine initialization failed: {e}");
            std::process::exit(1);
        }
    };

    log::info!("Starting event loop");
    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Poll;

        match event {
            Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
                WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,
                WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            state: ElementState::Pressed,
                            virtual_keycode: Some(key),
                            ..
                        },
                    ..
                } => match key {
                    VirtualKeyCode::Escape => *control_flow = ControlFlow::Exit,
                    VirtualKeyCode::V => {
                        vsync = !vsync;
                        log::info!("Vsync {}", if vsync { "on" } else { "off" });
                    }
                    _ => {}
                },
                // The engine picks up the new extent at its next acquire.
                WindowEvent::Resized(size) => {
                    log::debug!("Resized to {}x{}", size.width, size.height);
                }
                _ => {}
            },
            Event::WindowEvent {
                window_id,
                event: WindowEvent::CloseRequested,
            } if Some(window_id) == overlay_window.as_ref().map(Window::id) => {
                log::info!("Overlay window closed, quitting");
                *control_flow = ControlFlow::Exit;
            }
            Event::MainEventsCleared => {
                if let Some(engine) = engine.as_mut() {
                    if let Err(e) = run_frame(engine, vsync) {
                        log::error!("Frame failed: {e}");
                        *control_flow = ControlFlow::Exit;
                    }
                }
            }
            Event::LoopDestroyed => {
                log::info!("Event loop is shutting down");
                engine.take();
            }
            _ => {}
        }
    });
}
