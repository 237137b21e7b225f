//! Swapchain lifecycle and presentation, driven through the full engine
//! over the recording backend: reactive rebuilds, subscriber ordering,
//! overlay routing, and minimized windows.

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;
use rt_engine::prelude::*;
use rt_engine::render::backends::headless::{DeviceEvent, HeadlessBackend};

fn test_engine() -> (Engine, HeadlessBackend, vk::SurfaceKHR) {
    let (backend, surface) = HeadlessBackend::with_surface(1280, 720);
    let engine = Engine::with_backend(
        Box::new(backend.clone()),
        EngineSurfaces {
            primary: surface,
            overlay: None,
        },
        EngineSettings::default(),
        None,
    )
    .expect("engine construction");
    (engine, backend, surface)
}

fn overlay_engine() -> (Engine, HeadlessBackend, vk::SurfaceKHR, vk::SurfaceKHR) {
    let (backend, primary) = HeadlessBackend::with_surface(1280, 720);
    let overlay = backend.add_surface(vk::Extent2D {
        width: 640,
        height: 360,
    });
    let engine = Engine::with_backend(
        Box::new(backend.clone()),
        EngineSurfaces {
            primary,
            overlay: Some(overlay),
        },
        EngineSettings::default(),
        None,
    )
    .expect("engine construction");
    (engine, backend, primary, overlay)
}

fn run_frame(engine: &mut Engine) {
    engine.start_frame(&StartFrameInfo::default()).unwrap();
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();
}

fn present_outcomes(events: &[DeviceEvent]) -> Vec<PresentOutcome> {
    events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Presented { outcomes, .. } => Some(outcomes.clone()),
            _ => None,
        })
        .expect("the frame presented")
}

struct RecordingSubscriber {
    log: Rc<RefCell<Vec<String>>>,
}

impl SwapchainSubscriber for RecordingSubscriber {
    fn on_swapchain_destroy(&mut self) {
        self.log.borrow_mut().push("destroy".to_string());
    }

    fn on_swapchain_create(&mut self, properties: &SwapchainProperties) {
        self.log.borrow_mut().push(format!(
            "create {}x{}",
            properties.extent.width, properties.extent.height
        ));
    }
}

#[test]
fn test_resize_rebuilds_the_swapchain_exactly_once() {
    let (mut engine, backend, surface) = test_engine();
    run_frame(&mut engine);
    assert_eq!(engine.swapchain().recreations(), 1);
    let old_handle = engine.swapchain().handle();

    let log = Rc::new(RefCell::new(Vec::new()));
    engine.swapchain().subscribe(Box::new(RecordingSubscriber {
        log: Rc::clone(&log),
    }));

    backend.set_surface_extent(
        surface,
        vk::Extent2D {
            width: 1600,
            height: 900,
        },
    );
    let _ = backend.take_events();
    run_frame(&mut engine);

    assert_eq!(engine.swapchain().recreations(), 2);
    assert_eq!(engine.swapchain().extent().width, 1600);
    assert_eq!(
        *log.borrow(),
        vec!["destroy".to_string(), "create 1600x900".to_string()]
    );

    // The retired handle is chained into its replacement and destroyed
    // only after the replacement exists.
    let events = backend.take_events();
    let create_pos = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::SwapchainCreated { old, .. } if *old == old_handle))
        .expect("the replacement chains the old handle");
    let destroy_pos = events
        .iter()
        .position(
            |e| matches!(e, DeviceEvent::SwapchainDestroyed { swapchain } if *swapchain == old_handle),
        )
        .expect("the old handle is destroyed");
    assert!(create_pos < destroy_pos);

    // A steady surface does not rebuild again.
    run_frame(&mut engine);
    assert_eq!(engine.swapchain().recreations(), 2);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_stale_present_rebuilds_before_the_next_acquire() {
    let (mut engine, backend, surface) = test_engine();
    run_frame(&mut engine);
    let first_handle = engine.swapchain().handle();

    backend.fail_next_present(surface);
    let _ = backend.take_events();
    run_frame(&mut engine);

    let events = backend.take_events();
    assert_eq!(present_outcomes(&events), vec![PresentOutcome::Stale]);
    assert_eq!(engine.swapchain().recreations(), 2);
    let second_handle = engine.swapchain().handle();
    assert_ne!(second_handle, first_handle);

    // The next frame acquires from the replacement and presents cleanly.
    run_frame(&mut engine);
    let events = backend.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::ImageAcquired { swapchain, .. } if *swapchain == second_handle
    )));
    assert_eq!(present_outcomes(&events), vec![PresentOutcome::Presented]);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_minimized_surface_runs_frames_without_presenting() {
    let (mut engine, backend, surface) = test_engine();
    run_frame(&mut engine);

    backend.set_surface_extent(
        surface,
        vk::Extent2D {
            width: 0,
            height: 0,
        },
    );
    let _ = backend.take_events();
    run_frame(&mut engine);
    run_frame(&mut engine);
    assert_eq!(engine.frame_id(), 3);

    let events = backend.take_events();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, DeviceEvent::Presented { .. })),
        "a zero-area surface must not present"
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, DeviceEvent::ImageAcquired { .. })));
    // The frames still submit, with no image to wait on and nothing
    // downstream to signal.
    let submits: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Submitted { waits, signals, .. } => Some((waits.len(), signals.len())),
            _ => None,
        })
        .collect();
    assert_eq!(submits, vec![(0, 0), (0, 0)]);

    // Restoring the window brings presentation back.
    backend.set_surface_extent(
        surface,
        vk::Extent2D {
            width: 1280,
            height: 720,
        },
    );
    run_frame(&mut engine);
    let events = backend.take_events();
    assert_eq!(present_outcomes(&events), vec![PresentOutcome::Presented]);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_vsync_toggle_rebuilds_with_the_new_present_mode() {
    let (mut engine, backend, _surface) = test_engine();
    run_frame(&mut engine);
    assert_eq!(engine.swapchain().recreations(), 1);

    let _ = backend.take_events();
    engine
        .start_frame(&StartFrameInfo { vsync: false })
        .unwrap();
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();

    assert_eq!(engine.swapchain().recreations(), 2);
    let modes: Vec<vk::PresentModeKHR> = backend
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::SwapchainCreated { present_mode, .. } => Some(present_mode),
            _ => None,
        })
        .collect();
    assert_eq!(modes, vec![vk::PresentModeKHR::IMMEDIATE]);

    // The same request again is a steady state.
    engine
        .start_frame(&StartFrameInfo { vsync: false })
        .unwrap();
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    assert_eq!(engine.swapchain().recreations(), 2);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_overlay_surface_presents_in_the_same_call() {
    let (mut engine, backend, _primary, _overlay) = overlay_engine();

    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let modes: Vec<vk::PresentModeKHR> = backend
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::SwapchainCreated { present_mode, .. } => Some(present_mode),
            _ => None,
        })
        .collect();
    // The primary follows the vsync request; the overlay never waits for
    // vblank.
    assert_eq!(
        modes,
        vec![
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::IMMEDIATE
        ]
    );

    engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    let events = backend.take_events();

    let main = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Submitted { waits, signals, .. } => Some((waits.clone(), signals.clone())),
            _ => None,
        })
        .expect("the frame submitted");
    assert_eq!(main.0.len(), 2, "both image-available semaphores are waited");
    assert_eq!(main.1.len(), 1);
    let render_finished = main.1[0];

    let presented = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Presented {
                waits, swapchains, outcomes, ..
            } => Some((waits.clone(), swapchains.clone(), outcomes.clone())),
            _ => None,
        })
        .expect("the frame presented");
    assert_eq!(presented.0, vec![render_finished]);
    assert_eq!(presented.1.len(), 2, "one present call covers both surfaces");
    assert_eq!(
        presented.2,
        vec![PresentOutcome::Presented, PresentOutcome::Presented]
    );
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_surfaces_recreate_independently() {
    let (mut engine, backend, _primary, overlay) = overlay_engine();
    run_frame(&mut engine);
    assert_eq!(engine.swapchain().recreations(), 1);
    assert_eq!(engine.overlay_swapchain().unwrap().recreations(), 1);

    // Resizing the overlay leaves the primary chain alone.
    backend.set_surface_extent(
        overlay,
        vk::Extent2D {
            width: 800,
            height: 450,
        },
    );
    run_frame(&mut engine);
    assert_eq!(engine.swapchain().recreations(), 1);
    assert_eq!(engine.swapchain().extent().width, 1280);
    assert_eq!(engine.overlay_swapchain().unwrap().recreations(), 2);
    assert_eq!(engine.overlay_swapchain().unwrap().extent().width, 800);

    // A stale present on one surface only rebuilds that surface.
    backend.fail_next_present(overlay);
    let _ = backend.take_events();
    run_frame(&mut engine);
    let events = backend.take_events();
    assert_eq!(
        present_outcomes(&events),
        vec![PresentOutcome::Presented, PresentOutcome::Stale]
    );
    assert_eq!(engine.swapchain().recreations(), 1);
    assert_eq!(engine.overlay_swapchain().unwrap().recreations(), 3);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_minimized_primary_still_presents_the_overlay() {
    let (mut engine, backend, primary, _overlay) = overlay_engine();
    run_frame(&mut engine);

    backend.set_surface_extent(
        primary,
        vk::Extent2D {
            width: 0,
            height: 0,
        },
    );
    let _ = backend.take_events();
    run_frame(&mut engine);

    let events = backend.take_events();
    let presented = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Presented {
                swapchains, outcomes, ..
            } => Some((swapchains.clone(), outcomes.clone())),
            _ => None,
        })
        .expect("the overlay still presented");
    assert_eq!(presented.0.len(), 1);
    assert_eq!(presented.1, vec![PresentOutcome::Presented]);

    // Only the overlay's image-available is waited; the primary never
    // acquired an image this frame.
    let main_waits = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Submitted { waits, .. } => Some(waits.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(main_waits, 1);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_blit_rides_the_frame_command_buffer() {
    let (mut engine, backend, _surface) = test_engine();
    run_frame(&mut engine);

    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let frame_cmd = engine.frame_cmd().expect("frame is open");
    let rendered = vk::Image::from_raw(0x51C2);

    let _ = backend.take_events();
    engine
        .draw_frame(&DrawFrameInfo {
            blit: Some(PresentBlit {
                image: rendered,
                extent: vk::Extent2D {
                    width: 1920,
                    height: 1080,
                },
                filter: vk::Filter::LINEAR,
            }),
            ..Default::default()
        })
        .unwrap();

    let events = backend.take_events();
    let blit_pos = events
        .iter()
        .position(|e| matches!(
            e,
            DeviceEvent::BlitRecorded { cmd, src, .. } if *cmd == frame_cmd && *src == rendered
        ))
        .expect("the blit is recorded into the frame's buffer");
    let submit_pos = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::Submitted { .. }))
        .unwrap();
    assert!(blit_pos < submit_pos, "the blit must land before submission");
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_overlay_blit_targets_the_overlay_image() {
    let (mut engine, backend, _primary, _overlay) = overlay_engine();
    run_frame(&mut engine);

    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let frame_cmd = engine.frame_cmd().expect("frame is open");
    let rendered = vk::Image::from_raw(0x51C2);
    let hud = vk::Image::from_raw(0x51C3);

    let blit = |image| {
        Some(PresentBlit {
            image,
            extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            filter: vk::Filter::NEAREST,
        })
    };
    let _ = backend.take_events();
    engine
        .draw_frame(&DrawFrameInfo {
            blit: blit(rendered),
            overlay_blit: blit(hud),
        })
        .unwrap();

    let blits: Vec<(vk::CommandBuffer, vk::Image, vk::Image)> = backend
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::BlitRecorded { cmd, src, dst } => Some((cmd, src, dst)),
            _ => None,
        })
        .collect();
    assert_eq!(blits.len(), 2);
    assert!(blits.iter().all(|(cmd, ..)| *cmd == frame_cmd));
    assert_eq!(blits[0].1, rendered);
    assert_eq!(blits[1].1, hud);
    // Two different surfaces, two different destination images.
    assert_ne!(blits[0].2, blits[1].2);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}
