//! Frame pipelining driven end to end over the recording backend.
//!
//! Every test runs the real StartFrame/DrawFrame loop. The backend's
//! violation tracking stands in for a validation layer: an empty violation
//! list after a scenario means the fence and pool discipline held
//! throughout.

use ash::vk;
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

fn run_frame(engine: &mut Engine) {
    engine.start_frame(&StartFrameInfo::default()).unwrap();
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();
}

fn submitted(events: &[DeviceEvent]) -> Vec<&DeviceEvent> {
    events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Submitted { .. }))
        .collect()
}

fn waited_fence_sets(events: &[DeviceEvent]) -> Vec<Vec<vk::Fence>> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::FencesWaited { fences } => Some(fences.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_slots_advance_in_order_and_wrap() {
    let (mut engine, backend, _surface) = test_engine();

    let mut slots = Vec::new();
    for _ in 0..MAX_FRAMES_IN_FLIGHT * 3 {
        engine.start_frame(&StartFrameInfo::default()).unwrap();
        slots.push(engine.frame_slot());
        engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    }

    assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
    assert_eq!(engine.frame_id(), 6);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_slot_fence_is_waited_before_its_pools_reset() {
    let (mut engine, backend, _surface) = test_engine();

    let mut early_fences = Vec::new();
    for frame in 0..6 {
        engine.start_frame(&StartFrameInfo::default()).unwrap();
        let events = backend.take_events();

        let wait_pos = events
            .iter()
            .position(|e| matches!(e, DeviceEvent::FencesWaited { .. }))
            .expect("every frame open waits fences");
        let reset_pos = events
            .iter()
            .position(|e| matches!(e, DeviceEvent::PoolReset { .. }))
            .expect("every frame open resets the slot's pools");
        assert!(
            wait_pos < reset_pos,
            "frame {frame}: pools reset before the slot fence wait"
        );

        // Without deferred work each open waits exactly the slot fence,
        // including the first occupancy of each slot, which passes on the
        // created-signaled fence instead of one that nothing will arm.
        let waited = waited_fence_sets(&events);
        assert_eq!(waited.len(), 1);
        assert_eq!(waited[0].len(), 1);
        if frame < MAX_FRAMES_IN_FLIGHT {
            early_fences.push(waited[0][0]);
        }

        engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    }

    assert_ne!(early_fences[0], early_fences[1], "slots own distinct fences");
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_upload_between_frames_is_chained_ahead_of_the_next_frame() {
    let (mut engine, backend, _surface) = test_engine();
    run_frame(&mut engine);
    run_frame(&mut engine);

    let upload = engine.upload_cmd().expect("deferred upload buffer");
    assert_eq!(engine.upload_cmd().unwrap(), upload, "parked buffer is stable");
    assert!(engine.frame_cmd().is_none());

    let _ = backend.take_events();
    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let open_events = backend.take_events();

    let acquire_semaphore = open_events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::ImageAcquired { semaphore, .. } => Some(*semaphore),
            _ => None,
        })
        .expect("the frame acquires an image");

    let pre = submitted(&open_events);
    assert_eq!(pre.len(), 1, "only the parked buffer is submitted at open");
    let DeviceEvent::Submitted {
        cmd,
        waits,
        signals,
        fence,
        timeline,
        ..
    } = pre[0]
    else {
        unreachable!()
    };
    assert_eq!(*cmd, upload);
    assert!(!*timeline);
    assert_eq!(waits.as_slice(), &[acquire_semaphore]);
    assert_eq!(signals.len(), 1);
    assert_ne!(signals[0], acquire_semaphore);
    assert_ne!(*fence, vk::Fence::null(), "deferred submissions arm a fence");
    let chained = signals[0];
    let upload_fence = *fence;

    engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    let close_events = backend.take_events();
    let mains = submitted(&close_events);
    assert_eq!(mains.len(), 1);
    let DeviceEvent::Submitted { cmd, waits, .. } = mains[0] else {
        unreachable!()
    };
    assert_ne!(*cmd, upload);
    // The upload consumed the image-available signal, so the frame's own
    // work waits the upload instead of the acquire.
    assert_eq!(waits.as_slice(), &[chained]);

    // The next open collects the upload's fence alongside the slot fence;
    // the one after is back to the slot fence alone.
    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let waited = waited_fence_sets(&backend.take_events());
    assert_eq!(waited.len(), 1);
    assert_eq!(waited[0].len(), 2);
    assert!(waited[0].contains(&upload_fence));
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();

    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let waited = waited_fence_sets(&backend.take_events());
    assert_eq!(waited[0].len(), 1);
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();

    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_upload_before_the_first_frame_survives_slot_reuse() {
    let (mut engine, backend, _surface) = test_engine();

    let upload = engine.upload_cmd().expect("upload before any frame");
    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let open_events = backend.take_events();
    assert!(
        open_events.iter().any(|e| matches!(
            e,
            DeviceEvent::Submitted { cmd, .. } if *cmd == upload
        )),
        "the parked upload is submitted at the first frame open"
    );
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();

    // Cycling through every slot exercises the reset of the pool the
    // upload was recorded from.
    for _ in 0..MAX_FRAMES_IN_FLIGHT + 1 {
        run_frame(&mut engine);
    }
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

#[test]
fn test_upload_inside_an_open_frame_uses_the_frame_buffer() {
    let (mut engine, backend, _surface) = test_engine();
    run_frame(&mut engine);

    engine.start_frame(&StartFrameInfo::default()).unwrap();
    let frame_cmd = engine.frame_cmd().expect("frame is open");
    assert_eq!(engine.upload_cmd().unwrap(), frame_cmd);

    let _ = backend.take_events();
    engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    let events = backend.take_events();
    assert_eq!(
        submitted(&events).len(),
        1,
        "in-frame uploads ride the frame's own submission"
    );
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
}

/// Tiny deterministic generator (xorshift64), enough to mix a workload.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn chance(&mut self, percent: u64) -> bool {
        self.next() % 100 < percent
    }

    fn pick<T: Copy>(&mut self, options: &[T]) -> T {
        options[(self.next() % options.len() as u64) as usize]
    }
}

#[test]
fn test_mixed_workload_soak_stays_clean() {
    let (mut engine, backend, surface) = test_engine();
    let mut rng = XorShift(0x2E8F_1A6B_0C44_97D3);
    let extents = [(1280u32, 720u32), (1600, 900), (800, 600), (2560, 1440)];
    let mut minimized = false;

    const FRAMES: u64 = 200;
    for _ in 0..FRAMES {
        if rng.chance(20) {
            engine.upload_cmd().unwrap();
        }
        if minimized {
            if rng.chance(60) {
                let (width, height) = rng.pick(&extents);
                backend.set_surface_extent(surface, vk::Extent2D { width, height });
                minimized = false;
            }
        } else {
            if rng.chance(6) {
                backend.set_surface_extent(
                    surface,
                    vk::Extent2D {
                        width: 0,
                        height: 0,
                    },
                );
                minimized = true;
            } else if rng.chance(12) {
                let (width, height) = rng.pick(&extents);
                backend.set_surface_extent(surface, vk::Extent2D { width, height });
            }
            if rng.chance(5) {
                backend.fail_next_acquire(surface);
            }
            if rng.chance(5) {
                backend.fail_next_present(surface);
            }
        }

        engine
            .start_frame(&StartFrameInfo {
                vsync: rng.chance(85),
            })
            .unwrap();
        engine.draw_frame(&DrawFrameInfo::default()).unwrap();
    }

    assert_eq!(engine.frame_id(), FRAMES);
    assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    assert!(
        engine.swapchain().recreations() >= 2,
        "the workload must have forced at least one rebuild"
    );

    drop(engine);
    assert_eq!(backend.live_object_count(), 0);
}
