//! Errors surfaced by a bake call.
//!
//! Every failure is scoped to the call that produced it: the call logs it,
//! releases what it built and returns it to the caller.

use crate::{
    gpu::{DeviceError, LayoutError, ObjectKind},
    render::pipeline::PipelineId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Precondition,
    Creation,
    Recording,
    Synchronization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    Begin,
    End,
}

impl std::fmt::Display for RecordOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecordOp::Begin => "begin",
            RecordOp::End => "end",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Submit,
    FenceWait,
    QueueIdle,
    Upload,
    Readback,
}

impl std::fmt::Display for SyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncOp::Submit => "queue submit",
            SyncOp::FenceWait => "fence wait",
            SyncOp::QueueIdle => "queue wait idle",
            SyncOp::Upload => "texel upload",
            SyncOp::Readback => "texel readback",
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IblError {
    #[error("pipeline {0:?} is not registered")]
    MissingPipeline(PipelineId),
    #[error("environment `{0}` has no environment texture")]
    MissingEnvironmentTexture(String),
    #[error("no queue named `{0}`")]
    MissingQueue(String),
    #[error("invalid texture: {0}")]
    InvalidTexture(String),
    #[error("can't create {object}: {source}")]
    Creation {
        object: ObjectKind,
        source: DeviceError,
    },
    #[error("can't {op} the command buffer: {source}")]
    Recording { op: RecordOp, source: DeviceError },
    #[error("illegal layout transition: {0}")]
    Layout(#[from] LayoutError),
    #[error("{op} failed: {source}")]
    Sync { op: SyncOp, source: DeviceError },
}

impl IblError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            IblError::MissingPipeline(_)
            | IblError::MissingEnvironmentTexture(_)
            | IblError::MissingQueue(_)
            | IblError::InvalidTexture(_) => ErrorCategory::Precondition,
            IblError::Creation { .. } => ErrorCategory::Creation,
            IblError::Recording { .. } | IblError::Layout(_) => ErrorCategory::Recording,
            IblError::Sync { .. } => ErrorCategory::Synchronization,
        }
    }
}

pub type IblResult<T> = Result<T, IblError>;

/// Attaches the object being built to a device result code.
pub(crate) trait Creating<T> {
    fn creating(self, object: ObjectKind) -> IblResult<T>;
}

impl<T> Creating<T> for Result<T, DeviceError> {
    fn creating(self, object: ObjectKind) -> IblResult<T> {
        self.map_err(|source| IblError::Creation { object, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_operation_and_code() {
        let err: IblResult<()> = Err(DeviceError::OutOfDeviceMemory).creating(ObjectKind::Framebuffer);
        let err = err.unwrap_err();
        assert_eq!(err.to_string(), "can't create framebuffer: out of device memory");
        assert_eq!(err.category(), ErrorCategory::Creation);

        let err = IblError::Sync {
            op: SyncOp::FenceWait,
            source: DeviceError::DeviceLost,
        };
        assert_eq!(err.to_string(), "fence wait failed: device lost");
        assert_eq!(err.category(), ErrorCategory::Synchronization);
    }
}
