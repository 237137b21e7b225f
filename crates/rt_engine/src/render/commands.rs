//! Command buffer management
//!
//! The [`CommandBufferManager`] has exclusive ownership of command pools and
//! buffers for the three queue families, and is the only code path that
//! submits to queues. Buffers live in per-slot pools that are reset, never
//! freed, when their slot comes around again; each pool's buffer vector grows
//! by a fixed chunk when a frame asks for more buffers than ever before.

use std::collections::HashMap;

use ash::vk;

use crate::frame::MAX_FRAMES_IN_FLIGHT;
use crate::render::api::{DeviceBackend, DeviceError, DeviceResult, QueueKind, SubmitRequest};
use crate::render::sync::{ToSignal, ToWait};

/// Buffers added to a pool each time it runs dry.
const CMD_ALLOC_STEP: u32 = 16;

/// One queue family's command buffers for one frame slot.
///
/// Invariant: `cur_count <= cmds.len()`. Buffers below `cur_count` were
/// checked out during the slot's current occupancy.
struct AllocatedCmds {
    pool: vk::CommandPool,
    cmds: Vec<vk::CommandBuffer>,
    cur_count: usize,
}

impl AllocatedCmds {
    fn new(backend: &mut dyn DeviceBackend, queue: QueueKind) -> DeviceResult<Self> {
        Ok(Self {
            pool: backend.create_command_pool(queue)?,
            cmds: Vec::new(),
            cur_count: 0,
        })
    }
}

/// Owner of all command pools/buffers and sole submitter to queues.
pub struct CommandBufferManager {
    slot: usize,
    graphics: Vec<AllocatedCmds>,
    compute: Vec<AllocatedCmds>,
    transfer: Vec<AllocatedCmds>,
    /// Owning queue of every buffer issued per slot, for submission routing.
    cmd_queues: Vec<HashMap<vk::CommandBuffer, QueueKind>>,
}

impl CommandBufferManager {
    /// Create pools for every slot of every queue family.
    ///
    /// The current slot starts on the last index, matching a frame sequence
    /// that begins at slot 0: work recorded before the first frame must not
    /// live in a pool that frame resets.
    pub fn new(backend: &mut dyn DeviceBackend) -> DeviceResult<Self> {
        let mut graphics = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut compute = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut transfer = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            graphics.push(AllocatedCmds::new(backend, QueueKind::Graphics)?);
            compute.push(AllocatedCmds::new(backend, QueueKind::Compute)?);
            transfer.push(AllocatedCmds::new(backend, QueueKind::Transfer)?);
        }

        Ok(Self {
            slot: MAX_FRAMES_IN_FLIGHT - 1,
            graphics,
            compute,
            transfer,
            cmd_queues: (0..MAX_FRAMES_IN_FLIGHT).map(|_| HashMap::new()).collect(),
        })
    }

    /// Reset the slot's three pools and make `slot` current.
    ///
    /// Invalidates every buffer previously issued for this slot. Must run
    /// exactly once before any `start_*_cmd` of the slot, and only after the
    /// slot's fence wait proved the GPU is done with those buffers.
    pub fn prepare_for_frame(
        &mut self,
        backend: &mut dyn DeviceBackend,
        slot: usize,
    ) -> DeviceResult<()> {
        self.slot = slot;
        for family in [
            &mut self.graphics[slot],
            &mut self.compute[slot],
            &mut self.transfer[slot],
        ] {
            backend.reset_command_pool(family.pool)?;
            family.cur_count = 0;
        }
        self.cmd_queues[slot].clear();
        Ok(())
    }

    /// Begin a one-time-submit graphics buffer for the current slot.
    pub fn start_graphics_cmd(
        &mut self,
        backend: &mut dyn DeviceBackend,
    ) -> DeviceResult<vk::CommandBuffer> {
        self.start_cmd(backend, QueueKind::Graphics)
    }

    /// Begin a one-time-submit compute buffer for the current slot.
    pub fn start_compute_cmd(
        &mut self,
        backend: &mut dyn DeviceBackend,
    ) -> DeviceResult<vk::CommandBuffer> {
        self.start_cmd(backend, QueueKind::Compute)
    }

    /// Begin a one-time-submit transfer buffer for the current slot.
    pub fn start_transfer_cmd(
        &mut self,
        backend: &mut dyn DeviceBackend,
    ) -> DeviceResult<vk::CommandBuffer> {
        self.start_cmd(backend, QueueKind::Transfer)
    }

    fn start_cmd(
        &mut self,
        backend: &mut dyn DeviceBackend,
        queue: QueueKind,
    ) -> DeviceResult<vk::CommandBuffer> {
        let slot = self.slot;
        let family = match queue {
            QueueKind::Graphics => &mut self.graphics[slot],
            QueueKind::Compute => &mut self.compute[slot],
            QueueKind::Transfer => &mut self.transfer[slot],
        };

        if family.cur_count == family.cmds.len() {
            log::debug!(
                "slot {slot}: growing {queue:?} pool to {} buffers",
                family.cmds.len() + CMD_ALLOC_STEP as usize
            );
            let fresh = backend.allocate_command_buffers(family.pool, CMD_ALLOC_STEP)?;
            family.cmds.extend(fresh);
        }

        let cmd = family.cmds[family.cur_count];
        family.cur_count += 1;

        backend.begin_command_buffer(cmd)?;
        self.cmd_queues[slot].insert(cmd, queue);
        Ok(cmd)
    }

    /// Look up which queue a buffer issued this slot belongs to.
    ///
    /// A buffer this manager did not issue this slot is a caller bug; the
    /// returned error is not recoverable.
    fn owning_queue(&self, cmd: vk::CommandBuffer) -> DeviceResult<QueueKind> {
        self.cmd_queues[self.slot]
            .get(&cmd)
            .copied()
            .ok_or_else(|| DeviceError::InvalidOperation {
                reason: format!("command buffer {cmd:?} was not issued for the current slot"),
            })
    }

    /// End and submit a buffer with no semaphores; `fence` may be null.
    pub fn submit(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> DeviceResult<()> {
        let queue = self.owning_queue(cmd)?;
        backend.end_command_buffer(cmd)?;
        backend.queue_submit(
            queue,
            &SubmitRequest {
                cmd,
                wait_semaphores: &[],
                wait_values: &[],
                signal_semaphores: &[],
                signal_values: &[],
                fence,
                timeline: false,
            },
        )
    }

    /// End and submit a buffer waiting on 0+ binary semaphores, signaling one
    /// semaphore (null to skip) and one fence (null to skip).
    pub fn submit_binary(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmd: vk::CommandBuffer,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> DeviceResult<()> {
        let queue = self.owning_queue(cmd)?;
        backend.end_command_buffer(cmd)?;

        let signal_semaphores: Vec<vk::Semaphore> = if signal_semaphore == vk::Semaphore::null() {
            Vec::new()
        } else {
            vec![signal_semaphore]
        };

        backend.queue_submit(
            queue,
            &SubmitRequest {
                cmd,
                wait_semaphores,
                wait_values: &[],
                signal_semaphores: &signal_semaphores,
                signal_values: &[],
                fence,
                timeline: false,
            },
        )
    }

    /// End and submit a buffer with timeline semantics: up to two waits and
    /// one signal, each carrying a 64-bit counter. Wait entries whose
    /// semaphore is null are skipped.
    pub fn submit_timeline(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
        waits: &[ToWait],
        signal: ToSignal,
    ) -> DeviceResult<()> {
        debug_assert!(waits.len() <= 2);
        let queue = self.owning_queue(cmd)?;
        backend.end_command_buffer(cmd)?;

        let mut wait_semaphores = Vec::with_capacity(waits.len());
        let mut wait_values = Vec::with_capacity(waits.len());
        for wait in waits {
            if wait.semaphore != vk::Semaphore::null() {
                wait_semaphores.push(wait.semaphore);
                wait_values.push(wait.value);
            }
        }

        let (signal_semaphores, signal_values) = if signal.semaphore == vk::Semaphore::null() {
            (Vec::new(), Vec::new())
        } else {
            (vec![signal.semaphore], vec![signal.value])
        };

        backend.queue_submit(
            queue,
            &SubmitRequest {
                cmd,
                wait_semaphores: &wait_semaphores,
                wait_values: &wait_values,
                signal_semaphores: &signal_semaphores,
                signal_values: &signal_values,
                fence,
                timeline: true,
            },
        )
    }

    /// Stall until the graphics queue drains.
    pub fn wait_graphics_idle(&mut self, backend: &mut dyn DeviceBackend) -> DeviceResult<()> {
        backend.queue_wait_idle(QueueKind::Graphics)
    }

    /// Stall until the compute queue drains.
    pub fn wait_compute_idle(&mut self, backend: &mut dyn DeviceBackend) -> DeviceResult<()> {
        backend.queue_wait_idle(QueueKind::Compute)
    }

    /// Stall until the transfer queue drains.
    pub fn wait_transfer_idle(&mut self, backend: &mut dyn DeviceBackend) -> DeviceResult<()> {
        backend.queue_wait_idle(QueueKind::Transfer)
    }

    /// Stall until the whole device drains.
    pub fn wait_device_idle(&mut self, backend: &mut dyn DeviceBackend) -> DeviceResult<()> {
        backend.device_wait_idle()
    }

    /// Destroy every pool (and with them all buffers).
    pub fn destroy(&mut self, backend: &mut dyn DeviceBackend) {
        for family in self
            .graphics
            .drain(..)
            .chain(self.compute.drain(..))
            .chain(self.transfer.drain(..))
        {
            backend.destroy_command_pool(family.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{DeviceEvent, HeadlessBackend};
    use ash::vk::Handle;

    fn manager() -> (HeadlessBackend, CommandBufferManager) {
        let mut backend = HeadlessBackend::new();
        let manager = CommandBufferManager::new(&mut backend).unwrap();
        (backend, manager)
    }

    #[test]
    fn test_submission_routes_to_owning_queue() {
        let (mut backend, mut manager) = manager();
        manager.prepare_for_frame(&mut backend, 0).unwrap();

        let graphics_cmd = manager.start_graphics_cmd(&mut backend).unwrap();
        let compute_cmd = manager.start_compute_cmd(&mut backend).unwrap();
        manager
            .submit(&mut backend, graphics_cmd, vk::Fence::null())
            .unwrap();
        manager
            .submit(&mut backend, compute_cmd, vk::Fence::null())
            .unwrap();

        let queues: Vec<QueueKind> = backend
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DeviceEvent::Submitted { queue, .. } => Some(queue),
                _ => None,
            })
            .collect();
        assert_eq!(queues, vec![QueueKind::Graphics, QueueKind::Compute]);
    }

    #[test]
    fn test_pool_reset_reuses_the_same_buffers() {
        let (mut backend, mut manager) = manager();
        manager.prepare_for_frame(&mut backend, 0).unwrap();
        let first = manager.start_graphics_cmd(&mut backend).unwrap();
        let second = manager.start_graphics_cmd(&mut backend).unwrap();
        assert_ne!(first, second);

        manager.prepare_for_frame(&mut backend, 0).unwrap();
        let reissued = manager.start_graphics_cmd(&mut backend).unwrap();
        assert_eq!(first, reissued);
    }

    #[test]
    fn test_pool_grows_by_exactly_one_chunk() {
        let (mut backend, mut manager) = manager();
        manager.prepare_for_frame(&mut backend, 0).unwrap();

        let mut issued = Vec::new();
        for _ in 0..CMD_ALLOC_STEP {
            issued.push(manager.start_graphics_cmd(&mut backend).unwrap());
        }
        let allocations_before: Vec<u32> = allocation_counts(&backend);
        assert_eq!(allocations_before, vec![CMD_ALLOC_STEP]);

        // One request beyond the chunk triggers exactly one more chunk.
        issued.push(manager.start_graphics_cmd(&mut backend).unwrap());
        let allocations_after: Vec<u32> = allocation_counts(&backend);
        assert_eq!(allocations_after, vec![CMD_ALLOC_STEP, CMD_ALLOC_STEP]);

        // Earlier handles stay valid for the rest of the frame.
        for cmd in issued {
            manager.submit(&mut backend, cmd, vk::Fence::null()).unwrap();
        }
        assert!(backend.violations().is_empty());
    }

    fn allocation_counts(backend: &HeadlessBackend) -> Vec<u32> {
        backend
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DeviceEvent::CommandBuffersAllocated { count, .. } => Some(count),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unknown_buffer_is_an_invalid_operation() {
        let (mut backend, mut manager) = manager();
        manager.prepare_for_frame(&mut backend, 0).unwrap();

        let foreign = vk::CommandBuffer::from_raw(0xDEAD_BEEF);
        let result = manager.submit(&mut backend, foreign, vk::Fence::null());
        assert!(matches!(
            result,
            Err(DeviceError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_buffers_from_a_previous_slot_are_not_submittable() {
        let (mut backend, mut manager) = manager();
        manager.prepare_for_frame(&mut backend, 0).unwrap();
        let stale = manager.start_graphics_cmd(&mut backend).unwrap();

        manager.prepare_for_frame(&mut backend, 1).unwrap();
        let result = manager.submit(&mut backend, stale, vk::Fence::null());
        assert!(matches!(
            result,
            Err(DeviceError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_timeline_submission_carries_values_and_skips_null_waits() {
        let (mut backend, mut manager) = manager();
        let shared = backend.create_timeline_semaphore(0, "shared fence").unwrap();
        let target = backend.create_timeline_semaphore(0, "target").unwrap();
        manager.prepare_for_frame(&mut backend, 0).unwrap();

        let cmd = manager.start_transfer_cmd(&mut backend).unwrap();
        manager
            .submit_timeline(
                &mut backend,
                cmd,
                vk::Fence::null(),
                &[
                    ToWait {
                        semaphore: shared,
                        value: 41,
                    },
                    ToWait {
                        semaphore: vk::Semaphore::null(),
                        value: 7,
                    },
                ],
                ToSignal {
                    semaphore: target,
                    value: 42,
                },
            )
            .unwrap();

        let submits: Vec<DeviceEvent> = backend
            .events()
            .into_iter()
            .filter(|event| matches!(event, DeviceEvent::Submitted { .. }))
            .collect();
        assert_eq!(submits.len(), 1);
        match &submits[0] {
            DeviceEvent::Submitted {
                queue,
                waits,
                wait_values,
                signals,
                signal_values,
                timeline,
                ..
            } => {
                assert_eq!(*queue, QueueKind::Transfer);
                assert!(*timeline);
                assert_eq!(waits.as_slice(), &[shared]);
                assert_eq!(wait_values.as_slice(), &[41]);
                assert_eq!(signals.as_slice(), &[target]);
                assert_eq!(signal_values.as_slice(), &[42]);
            }
            _ => unreachable!(),
        }
    }
}
