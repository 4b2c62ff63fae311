use std::sync::Arc;

use crate::{
    error::{Creating, IblError, IblResult, RecordOp, SyncOp},
    gpu::{
        CommandBufferHandle, CommandList, CommandPoolHandle, DeviceError, FenceHandle, GpuDevice,
        ObjectKind, Owned, QueueInfo,
    },
};

fn failed(op: SyncOp) -> impl FnOnce(DeviceError) -> IblError {
    move |source| IblError::Sync { op, source }
}

/// One command buffer, its pool and the fence guarding its submission.
pub struct SyncGate {
    fence: Owned<FenceHandle>,
    command_buffer: Owned<CommandBufferHandle>,
    command_pool: Owned<CommandPoolHandle>,
    queue: QueueInfo,
    device: Arc<dyn GpuDevice>,
}

impl SyncGate {
    pub fn new(device: &Arc<dyn GpuDevice>, queue: QueueInfo) -> IblResult<Self> {
        let command_pool = device
            .create_command_pool(&queue)
            .creating(ObjectKind::CommandPool)?;
        let command_pool = Owned::new(device, command_pool);

        let command_buffer = device
            .allocate_command_buffer(command_pool.handle())
            .creating(ObjectKind::CommandBuffer)?;
        let command_buffer = Owned::new(device, command_buffer);

        let fence = device.create_fence(false).creating(ObjectKind::Fence)?;

        Ok(Self {
            fence: Owned::new(device, fence),
            command_buffer,
            command_pool,
            queue,
            device: Arc::clone(device),
        })
    }

    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer.handle()
    }

    pub fn command_pool(&self) -> CommandPoolHandle {
        self.command_pool.handle()
    }

    pub fn begin(&self) -> IblResult<()> {
        self.device
            .begin_command_buffer(self.command_buffer())
            .map_err(|source| IblError::Recording {
                op: RecordOp::Begin,
                source,
            })
    }

    pub fn end(&self, commands: CommandList) -> IblResult<()> {
        self.device
            .end_command_buffer(self.command_buffer(), commands)
            .map_err(|source| IblError::Recording {
                op: RecordOp::End,
                source,
            })
    }

    /// Submits the buffer and blocks until the fence signals and the queue
    /// is idle.
    pub fn submit_and_wait(&self) -> IblResult<()> {
        self.device
            .submit(&self.queue, self.command_buffer(), Some(self.fence.handle()))
            .map_err(failed(SyncOp::Submit))?;

        if let Err(source) = self.device.wait_for_fence(self.fence.handle(), None) {
            // Still drain the queue so nothing is released under in-flight work.
            if let Err(idle) = self.device.queue_wait_idle(&self.queue) {
                log::warn!("Queue `{}` did not go idle either: {idle}", self.queue.name);
            }
            return Err(failed(SyncOp::FenceWait)(source));
        }

        self.device
            .queue_wait_idle(&self.queue)
            .map_err(failed(SyncOp::QueueIdle))
    }
}
