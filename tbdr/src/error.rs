use thiserror::Error;

/// Errors surfaced by recording, resource creation and submission.
///
/// Errors are `Copy` so that a command buffer can latch the first one it hits and report it
/// again when recording ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Error)]
pub enum Error {
    /// A host-side allocation (staging data, program upload metadata) failed.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// Device memory is exhausted, or a free list is already at its maximum size.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// The execution transport rejected a job.
    #[error("job submission failed")]
    SubmissionFailed,
    #[error("device lost")]
    DeviceLost,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
