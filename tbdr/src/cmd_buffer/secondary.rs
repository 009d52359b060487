//! Execution of secondary command buffers.
//!
//! Inside a render pass, the graphics sub-commands of a secondary are spliced into the primary's
//! open render: either linked to (the secondary stream returns to the primary) or, for deferred
//! streams, copied, after which the depth bias / scissor indices recorded by the secondary are
//! rebased onto the primary's tables. Outside a render pass, the secondary's sub-commands are
//! referenced from the primary's execution order without being copied.
use crate::{
    cmd_buffer::{
        state::DirtyFlags, CommandBuffer, DeferredPatch, DepthStencilUsage, GraphicsSubCmd, SubCmdType, SubCommand,
    },
    csb::Slot,
    hw::{ta, vdm},
    memory::Heap,
    stage::PipelineStage,
    Result,
};
use std::sync::Arc;
use tracing::{debug, trace, trace_span};

/// Offsets added to the table indices recorded by a secondary.
#[derive(Copy, Clone, Debug)]
struct TableBases {
    depth_bias: u32,
    scissor: u32,
}

impl CommandBuffer {
    /// Executes secondary command buffers.
    ///
    /// The secondaries must stay alive (and must not be reset) until the primary is done with
    /// them.
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) -> Result<()> {
        let _span = trace_span!("execute_commands", count = secondaries.len()).entered();
        debug_assert!(!self.is_secondary());
        debug_assert!(secondaries.iter().all(|sec| sec.is_secondary()));
        let last = match secondaries.last() {
            Some(last) => *last,
            None => return Ok(()),
        };

        self.record(|cb| {
            // the state a secondary leaves the hardware in is unknown
            cb.state.reset_graphics_dirty_state(false);

            if cb.current_type() == Some(SubCmdType::Graphics) {
                for sec in secondaries {
                    cb.execute_graphics_secondary(sec)?;
                }
                for (needed, sec_needed) in cb.state.barriers_needed.iter_mut().zip(last.state.barriers_needed.iter()) {
                    *needed |= *sec_needed & PipelineStage::ALL_GRAPHICS;
                }
            } else {
                for sec in secondaries {
                    cb.end_sub_cmd()?;
                    for sub_cmd in sec.sub_commands() {
                        cb.push_borrowed(&sub_cmd);
                    }
                    trace!(sub_cmds = sec.sub_command_count(), "secondary sub-commands referenced");
                }
                cb.state.barriers_needed = last.state.barriers_needed;
            }
            Ok(())
        })
    }

    fn execute_graphics_secondary(&mut self, sec: &CommandBuffer) -> Result<()> {
        debug_assert!(!self.state.vis_test_enabled, "inherited queries are not supported");
        let sub_cmds: Vec<Arc<SubCommand>> = sec.sub_commands().collect();
        let first = match sub_cmds.first().and_then(|s| s.as_graphics()) {
            Some(first) => first,
            None => return Ok(()),
        };

        let current_pool = self.current_gfx_mut().and_then(|gfx| gfx.query_pool.clone());
        if let (Some(current), Some(sec_pool)) = (current_pool, first.query_pool.as_ref()) {
            if !Arc::ptr_eq(&current, sec_pool) {
                debug!("secondary uses another query pool, splitting the render");
                self.split_render(false, true, false)?;
            }
        }

        let bases = TableBases {
            depth_bias: self.depth_bias_array.len() as u32,
            scissor: self.scissor_array.len() as u32,
        };
        let deferred = sec.uses_deferred_streams();

        for (i, sub_cmd) in sub_cmds.iter().enumerate() {
            let sec_gfx = match sub_cmd.as_graphics() {
                Some(gfx) => gfx,
                None => {
                    debug_assert!(false, "only graphics secondaries can be executed in a render pass");
                    continue;
                }
            };

            for index in sec_gfx.sec_query_indices.iter() {
                self.state.add_query_index(*index);
            }

            self.with_current_gfx(|cb, gfx| {
                if deferred {
                    let copied = gfx.csb.copy_from(&sec_gfx.csb)?;
                    cb.apply_patches(gfx, sec_gfx, bases, Some(copied))?;
                } else {
                    cb.apply_patches(gfx, sec_gfx, bases, None)?;
                    gfx.csb.emit_link(sec_gfx.csb.start_addr(), true)?;
                }
                merge_render_state(gfx, sec_gfx, cb.device.info().compute_overlap);
                Ok(())
            })?;

            if sec_gfx.barrier_store {
                // the secondary split its render: split the primary's too
                debug_assert!(i + 1 < sub_cmds.len(), "render split at the end of a secondary");
                let (load, store) = sub_cmds
                    .get(i + 1)
                    .and_then(|next| next.as_graphics())
                    .map(|next| (next.barrier_load, next.barrier_store))
                    .unwrap_or((true, false));
                self.split_render(true, load, store)?;
            }
        }

        self.depth_bias_array.extend_from_slice(&sec.depth_bias_array);
        self.scissor_array.extend_from_slice(&sec.scissor_array);
        self.state.dirty |= DirtyFlags::DEPTH_BIAS;
        trace!(
            deferred,
            sub_cmds = sub_cmds.len(),
            depth_bias_base = bases.depth_bias,
            scissor_base = bases.scissor,
            "secondary executed in render"
        );
        Ok(())
    }

    /// Closes the current render with a store of its tiles and opens a new one on the same render
    /// setup.
    fn split_render(&mut self, keep_non_empty: bool, barrier_load: bool, barrier_store: bool) -> Result<()> {
        if let Some(gfx) = self.current_gfx_mut() {
            gfx.barrier_store = true;
            if keep_non_empty {
                gfx.empty_cmd = false;
            }
        }
        self.end_sub_cmd()?;
        self.start_sub_cmd(SubCmdType::Graphics)?;
        if let Some(gfx) = self.current_gfx_mut() {
            gfx.barrier_load = barrier_load;
            gfx.barrier_store = barrier_store;
            if keep_non_empty {
                gfx.empty_cmd = false;
            }
        }
        Ok(())
    }

    /// Resolves the depth bias / scissor indices recorded by a secondary sub-command.
    ///
    /// `copied` is where a deferred stream was copied to in `gfx`.
    fn apply_patches(
        &mut self,
        gfx: &mut GraphicsSubCmd,
        sec_gfx: &GraphicsSubCmd,
        bases: TableBases,
        copied: Option<Slot>,
    ) -> Result<()> {
        for patch in sec_gfx.patches.iter() {
            match patch {
                DeferredPatch::Dbsc {
                    depthbias_index,
                    scissor_index,
                    slot,
                } => {
                    let copied = match copied {
                        Some(copied) => copied,
                        None => {
                            debug_assert!(false, "DBSC patch in a stream that is not copied");
                            continue;
                        }
                    };
                    let state = [
                        ta::header(ta::StateHeader::PRES_ISPCTL_DBSC, 0),
                        ta::ispdbsc(bases.depth_bias + depthbias_index, bases.scissor + scissor_index),
                    ];
                    let addr = self.upload(Heap::General, &state)?;
                    gfx.csb.write(
                        copied.sub(slot.offset(), vdm::LINK_WORDS),
                        &vdm::ppp_state(addr, state.len() as u32),
                    );
                }
                DeferredPatch::Dbsc2 {
                    depthbias_index,
                    scissor_index,
                    bo,
                    offset_dw,
                } => {
                    bo.write(
                        *offset_dw as u64 * 4,
                        &[ta::ispdbsc(bases.depth_bias + depthbias_index, bases.scissor + scissor_index)],
                    );
                }
            }
        }
        Ok(())
    }
}

/// Merges what a secondary render needs from the render it is executed in.
fn merge_render_state(gfx: &mut GraphicsSubCmd, sec_gfx: &GraphicsSubCmd, compute_overlap: bool) {
    if !sec_gfx.empty_cmd {
        gfx.empty_cmd = false;
    }
    if sec_gfx.query_pool.is_some() {
        gfx.query_pool = sec_gfx.query_pool.clone();
    }
    if compute_overlap {
        gfx.disable_compute_overlap |= sec_gfx.disable_compute_overlap;
    }
    gfx.max_tiles_in_flight = gfx.max_tiles_in_flight.min(sec_gfx.max_tiles_in_flight);
    if sec_gfx.depth_usage == DepthStencilUsage::Needed {
        gfx.depth_usage = DepthStencilUsage::Needed;
    }
    if sec_gfx.stencil_usage == DepthStencilUsage::Needed {
        gfx.stencil_usage = DepthStencilUsage::Needed;
    }
    gfx.modifies_depth |= sec_gfx.modifies_depth;
    gfx.modifies_stencil |= sec_gfx.modifies_stencil;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmd_buffer::{BeginInfo, ClearValue, InheritanceInfo, RenderPassBeginInfo},
        memory::{DevAddr, HostMemory},
        pass::{Framebuffer, RenderPass},
        testing, vk,
    };

    fn render_area() -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: 128,
                height: 128,
            },
        }
    }

    fn scissor(x: i32) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x, y: 0 },
            extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
        }
    }

    fn secondary_in_pass(
        device: &Arc<crate::device::Device>,
        pass: &Arc<RenderPass>,
        fb: &Arc<Framebuffer>,
        usage: vk::CommandBufferUsageFlags,
    ) -> CommandBuffer {
        let mut sec = CommandBuffer::new(device, vk::CommandBufferLevel::SECONDARY);
        sec.begin(&BeginInfo {
            usage: usage | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            inheritance: Some(InheritanceInfo {
                render_pass: Some(pass.clone()),
                subpass: 0,
                framebuffer: Some(fb.clone()),
                occlusion_query_enable: false,
            }),
        })
        .unwrap();
        sec
    }

    fn primary_in_pass(
        device: &Arc<crate::device::Device>,
        pass: &Arc<RenderPass>,
        fb: &Arc<Framebuffer>,
    ) -> CommandBuffer {
        let mut cb = CommandBuffer::new(device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.begin_render_pass(&RenderPassBeginInfo {
            render_pass: pass.clone(),
            framebuffer: fb.clone(),
            render_area: render_area(),
            clear_values: vec![ClearValue::default()],
        })
        .unwrap();
        cb
    }

    /// Finds the PPP_STATE blocks of a graphics stream, as (address, word count).
    fn ppp_state_blocks(words: &[u32]) -> Vec<(DevAddr, u32)> {
        words
            .windows(2)
            .filter(|w| vdm::block_type(w[0]) == vdm::PPP_STATE_UPDATE && w[0] != 0)
            .map(|w| (DevAddr(((w[0] & 0xff) as u64) << 32 | w[1] as u64), (w[0] >> 8) & 0xffff))
            .collect()
    }

    #[test]
    fn secondaries_outside_a_render_pass_are_referenced() {
        let device = testing::device();
        let mut sec = CommandBuffer::new(&device, vk::CommandBufferLevel::SECONDARY);
        sec.begin(&BeginInfo::default()).unwrap();
        sec.fill_buffer(DevAddr(0x1_0000_0000), 64, 0).unwrap();
        sec.end().unwrap();

        let mut cb = CommandBuffer::new(&device, vk::CommandBufferLevel::PRIMARY);
        cb.begin(&BeginInfo::default()).unwrap();
        cb.copy_buffer(DevAddr(0x1_0000_1000), DevAddr(0x1_0000_2000), 16).unwrap();
        cb.execute_commands(&[&sec, &sec]).unwrap();
        cb.end().unwrap();

        let sub_cmds: Vec<_> = cb.sub_commands().collect();
        assert_eq!(sub_cmds.len(), 3);
        let sec_sub_cmd = sec.sub_commands().next().unwrap();
        assert!(Arc::ptr_eq(&sub_cmds[1], &sec_sub_cmd));
        assert!(Arc::ptr_eq(&sub_cmds[2], &sec_sub_cmd));
        drop(sub_cmds);
        drop(sec_sub_cmd);

        // a reset secondary no longer contributes
        sec.reset();
        assert_eq!(cb.sub_commands().count(), 1);
    }

    #[test]
    fn secondary_stream_is_linked_with_return() {
        let device = testing::device();
        let pass = testing::single_color_pass(&device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(&device, &pass, 128, 128, 1);
        let pipeline = testing::graphics_pipeline(&device);

        let mut sec = secondary_in_pass(&device, &pass, &fb, vk::CommandBufferUsageFlags::empty());
        sec.bind_graphics_pipeline(&pipeline);
        sec.draw(3, 1, 0, 0).unwrap();
        sec.end().unwrap();
        let sec_start = sec.sub_commands().next().unwrap().as_graphics().unwrap().control_stream().start_addr();

        let mut cb = primary_in_pass(&device, &pass, &fb);
        cb.execute_commands(&[&sec]).unwrap();
        let gfx = cb.current.as_ref().unwrap().as_graphics().unwrap();
        assert!(!gfx.is_empty());
        let words = gfx.control_stream().words();
        let link = vdm::stream_link(sec_start, true);
        assert!(words.windows(2).any(|w| w == link));
        cb.end_render_pass().unwrap();
        cb.end().unwrap();
    }

    #[test]
    fn deferred_stream_is_copied_and_rebased() {
        let host = Arc::new(HostMemory::new());
        let device = testing::device_on(host.clone());
        let pass = testing::single_color_pass(&device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(&device, &pass, 128, 128, 1);
        let pipeline = testing::graphics_pipeline(&device);

        let mut sec = secondary_in_pass(&device, &pass, &fb, vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        assert!(sec.uses_deferred_streams());
        sec.bind_graphics_pipeline(&pipeline);
        sec.set_scissor(0, &[scissor(32)]);
        sec.draw(3, 1, 0, 0).unwrap();
        sec.end().unwrap();
        assert_eq!(sec.scissor_array.len(), 1);

        let mut cb = primary_in_pass(&device, &pass, &fb);
        cb.bind_graphics_pipeline(&pipeline);
        cb.set_scissor(0, &[scissor(0)]);
        cb.draw(3, 1, 0, 0).unwrap();
        cb.execute_commands(&[&sec]).unwrap();
        assert_eq!(cb.scissor_array.len(), 2);

        let gfx = cb.current.as_ref().unwrap().as_graphics().unwrap();
        let dbsc = ta::header(ta::StateHeader::PRES_ISPCTL_DBSC, 0);
        let rebased = ppp_state_blocks(&gfx.control_stream().words())
            .into_iter()
            .filter(|&(_, count)| count == 2)
            .filter_map(|(addr, _)| host.read(addr, 2))
            .find(|state| state[0] == dbsc);
        assert_eq!(rebased, Some(vec![dbsc, ta::ispdbsc(0, 1)]));

        // the primary's next draw with the secondary's scissor reuses its entry
        cb.set_scissor(0, &[scissor(32)]);
        cb.draw(3, 1, 0, 0).unwrap();
        assert_eq!(cb.scissor_array.len(), 2);
        assert_eq!(cb.state.ppp.scissor_index, 1);
        cb.end_render_pass().unwrap();
        cb.end().unwrap();
    }

    #[test]
    fn render_state_is_merged() {
        let device = testing::device();
        let pass = testing::single_color_pass(&device, vk::Format::R8G8B8A8_UNORM, 1);
        let fb = testing::framebuffer(&device, &pass, 128, 128, 1);
        let pipeline = testing::graphics_pipeline(&device);

        let mut sec = secondary_in_pass(&device, &pass, &fb, vk::CommandBufferUsageFlags::empty());
        sec.bind_graphics_pipeline(&pipeline);
        sec.draw(3, 1, 0, 0).unwrap();
        sec.end().unwrap();

        let mut cb = primary_in_pass(&device, &pass, &fb);
        let before = cb.current.as_ref().unwrap().as_graphics().unwrap().max_tiles_in_flight();
        cb.execute_commands(&[&sec]).unwrap();
        let gfx = cb.current.as_ref().unwrap().as_graphics().unwrap();
        assert_eq!(gfx.max_tiles_in_flight(), before);
        assert!(!gfx.is_empty());
        assert!(cb.state.dirty.contains(DirtyFlags::DEPTH_BIAS));
    }
}
