//! Command recording and job translation core for a tile-based deferred rendering GPU.
//!
//! Command buffers record into hardware control streams ([`csb`]) grouped in sub-commands; a
//! [`Queue`] turns recorded sub-commands into [`Job`]s handed to a [`Transport`].

mod error;
pub(crate) mod util;

pub mod cmd_buffer;
pub mod csb;
pub mod debug;
pub mod device;
pub mod free_list;
pub mod hw;
pub mod job;
pub mod memory;
pub mod pass;
pub mod pipeline;
pub mod program;
pub mod query;
pub mod queue;
pub mod rt_dataset;
pub mod spm;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{Error, Result};

pub use crate::cmd_buffer::BeginInfo;
pub use crate::cmd_buffer::ClearValue;
pub use crate::cmd_buffer::CommandBuffer;
pub use crate::cmd_buffer::DependencyInfo;
pub use crate::cmd_buffer::InheritanceInfo;
pub use crate::cmd_buffer::RenderPassBeginInfo;
pub use crate::cmd_buffer::SubCommand;
pub use crate::debug::Diagnostics;
pub use crate::device::{Device, DeviceCreateInfo, DeviceInfo};
pub use crate::free_list::{FreeList, FreeListCreateInfo};
pub use crate::job::Job;
pub use crate::memory::{DevAddr, DeviceMemory, HostMemory};
pub use crate::pass::{Framebuffer, ImageView, RenderPass};
pub use crate::pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout};
pub use crate::program::{CompiledProgram, ProgramGenerator};
pub use crate::query::{Event, EventStatus, QueryPool};
pub use crate::queue::{Queue, SubmitInfo, SyncPoint, Transport};
pub use crate::rt_dataset::RenderTargetDataset;
pub use crate::stage::PipelineStage;

pub use ash;
pub use ash::vk;
