//! Control stream builder.
//!
//! A control stream is an append-only sequence of 32-bit words read by the VDM (graphics) or CDM
//! (compute) data masters. Device streams are backed by a chain of blocks linked with
//! `STREAM_LINK` words; deferred streams (recorded by secondaries that get copied into their
//! primary) live in host memory.
//!
//! # Relocation marks
//!
//! Some word sequences must stay contiguous (a state update header and its payload, a kernel
//! block). Callers bracket them with [`ControlStream::set_relocation_mark`] and
//! [`ControlStream::clear_relocation_mark`]. If the current block runs out of space while the mark
//! is set, the words written since the mark are moved to the start of the new block, and the link
//! to the new block is written where they used to be.
//!
//! Slots returned by [`ControlStream::alloc_words`] inside a marked region are invalidated by such
//! a move; write them before allocating again.
use crate::{
    debug::Diagnostics,
    device::Device,
    hw::{cdm, vdm, CSB_BLOCK_SIZE},
    memory::{Bo, DevAddr, Heap},
    util::align,
    Result,
};
use std::{fmt, sync::Arc};
use tracing::{trace, warn};

/// Kind of a control stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StreamType {
    Graphics,
    /// Graphics stream kept in host memory, to be copied into a primary's stream.
    GraphicsDeferred,
    Compute,
}

/// State of the relocation mark, tracked in debug builds or when
/// [`Diagnostics::TRACK_RELOCATION_MARKS`] is set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RelocationMark {
    Unset,
    Set,
    SetAndConsumed,
    Cleared,
}

/// A range of words allocated in a control stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Slot {
    block: usize,
    offset: u32,
    len: u32,
}

impl Slot {
    /// Word offset within the block (or within the whole stream for deferred streams).
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-range of this slot.
    pub fn sub(&self, offset: u32, len: u32) -> Slot {
        debug_assert!(offset + len <= self.len);
        Slot {
            block: self.block,
            offset: self.offset + offset,
            len,
        }
    }
}

struct Block {
    bo: Bo,
    /// Host copy of the words written so far; its length is the write offset.
    words: Vec<u32>,
    capacity: u32,
}

/// Device addresses of a finished stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BakedStream {
    pub ty: StreamType,
    pub start: DevAddr,
    pub blocks: Vec<DevAddr>,
    pub len_words: u32,
}

/// Control stream builder.
pub struct ControlStream {
    device: Arc<Device>,
    ty: StreamType,
    blocks: Vec<Block>,
    deferred: Vec<u32>,
    relocation_mark: Option<u32>,
    mark_status: RelocationMark,
    warned_unmarked: bool,
}

impl ControlStream {
    pub fn new(device: &Arc<Device>, ty: StreamType) -> ControlStream {
        ControlStream {
            device: device.clone(),
            ty,
            blocks: Vec::new(),
            deferred: Vec::new(),
            relocation_mark: None,
            mark_status: RelocationMark::Unset,
            warned_unmarked: false,
        }
    }

    pub fn ty(&self) -> StreamType {
        self.ty
    }

    pub fn mark_status(&self) -> RelocationMark {
        self.mark_status
    }

    fn link_words(&self, addr: DevAddr, with_return: bool) -> [u32; 2] {
        match self.ty {
            StreamType::Compute => {
                debug_assert!(!with_return, "compute streams cannot return");
                cdm::stream_link(addr)
            }
            StreamType::Graphics | StreamType::GraphicsDeferred => vdm::stream_link(addr, with_return),
        }
    }

    fn link_len(&self) -> u32 {
        match self.ty {
            StreamType::Compute => cdm::LINK_WORDS,
            _ => vdm::LINK_WORDS,
        }
    }

    fn consume_mark(&mut self) {
        if !self.device.diagnostics().track_relocation_marks() {
            return;
        }
        match self.mark_status {
            RelocationMark::Set => self.mark_status = RelocationMark::SetAndConsumed,
            RelocationMark::SetAndConsumed | RelocationMark::Unset => {}
            RelocationMark::Cleared => {
                if !self.warned_unmarked {
                    warn!(stream = ?self.ty, "control stream words emitted without a relocation mark");
                    self.warned_unmarked = true;
                }
            }
        }
    }

    /// Starts a region that must stay contiguous.
    pub fn set_relocation_mark(&mut self) {
        if self.device.diagnostics().track_relocation_marks() {
            debug_assert!(
                matches!(self.mark_status, RelocationMark::Unset | RelocationMark::Cleared),
                "relocation mark already set"
            );
            self.mark_status = RelocationMark::Set;
        }
        self.relocation_mark = Some(match self.ty {
            StreamType::GraphicsDeferred => self.deferred.len() as u32,
            _ => self.blocks.last().map(|b| b.words.len() as u32).unwrap_or(0),
        });
    }

    /// Ends the contiguous region.
    pub fn clear_relocation_mark(&mut self) {
        if self.device.diagnostics().track_relocation_marks() {
            debug_assert_eq!(
                self.mark_status,
                RelocationMark::SetAndConsumed,
                "relocation mark cleared without being used"
            );
            self.mark_status = RelocationMark::Cleared;
        }
        self.relocation_mark = None;
    }

    /// Allocates `count` words, growing the stream if needed.
    pub fn alloc_words(&mut self, count: u32) -> Result<Slot> {
        if self.ty == StreamType::GraphicsDeferred {
            let offset = self.deferred.len() as u32;
            self.deferred.resize((offset + count) as usize, 0);
            self.consume_mark();
            return Ok(Slot {
                block: 0,
                offset,
                len: count,
            });
        }

        let link_len = self.link_len();
        let fits = self
            .blocks
            .last()
            .map(|b| b.words.len() as u32 + count + link_len <= b.capacity)
            .unwrap_or(false);
        if !fits {
            self.grow(count)?;
        }

        let block_index = self.blocks.len() - 1;
        let block = &mut self.blocks[block_index];
        let offset = block.words.len() as u32;
        block.words.resize((offset + count) as usize, 0);
        self.consume_mark();
        Ok(Slot {
            block: block_index,
            offset,
            len: count,
        })
    }

    fn grow(&mut self, count: u32) -> Result<()> {
        let link_len = self.link_len();
        let moved: Vec<u32> = match (self.relocation_mark, self.blocks.last()) {
            (Some(mark), Some(last)) => last.words[mark as usize..].to_vec(),
            _ => Vec::new(),
        };

        let needed = (moved.len() as u64 + count as u64 + link_len as u64) * 4;
        let size = align(needed.max(CSB_BLOCK_SIZE), CSB_BLOCK_SIZE);
        let bo = self.device.alloc(Heap::General, size, CSB_BLOCK_SIZE)?;
        let new_addr = bo.addr();

        let zero_moved = self.device.diagnostics().contains(Diagnostics::DUMP_CONTROL_STREAM)
            || self.device.diagnostics().track_relocation_marks();
        let link = self.link_words(new_addr, false);
        let mark = self.relocation_mark;
        if let Some(last) = self.blocks.last_mut() {
            let old_len = last.words.len();
            let link_at = mark.map(|m| m as usize).unwrap_or(old_len);
            last.words.truncate(link_at);
            last.words.extend_from_slice(&link);
            last.bo.write(link_at as u64 * 4, &link);
            if zero_moved && old_len > last.words.len() {
                let zeros = vec![0; old_len - last.words.len()];
                last.bo.write(last.words.len() as u64 * 4, &zeros);
            }
        }

        if !moved.is_empty() {
            bo.write(0, &moved);
        }
        trace!(
            stream = ?self.ty,
            addr = ?new_addr,
            size,
            relocated_words = moved.len(),
            "control stream block added"
        );
        self.blocks.push(Block {
            bo,
            words: moved,
            capacity: (size / 4) as u32,
        });
        if mark.is_some() {
            self.relocation_mark = Some(0);
        }
        Ok(())
    }

    /// Writes words into a previously allocated slot.
    pub fn write(&mut self, slot: Slot, words: &[u32]) {
        debug_assert!(words.len() as u32 <= slot.len);
        let start = slot.offset as usize;
        match self.ty {
            StreamType::GraphicsDeferred => self.deferred[start..start + words.len()].copy_from_slice(words),
            _ => {
                let block = &mut self.blocks[slot.block];
                block.words[start..start + words.len()].copy_from_slice(words);
                block.bo.write(slot.offset as u64 * 4, words);
            }
        }
    }

    /// Appends words.
    pub fn emit(&mut self, words: &[u32]) -> Result<Slot> {
        let slot = self.alloc_words(words.len() as u32)?;
        self.write(slot, words);
        Ok(slot)
    }

    /// Emits a link to another stream. With `with_return`, a `STREAM_RETURN` in the target stream
    /// resumes execution after the link.
    pub fn emit_link(&mut self, addr: DevAddr, with_return: bool) -> Result<()> {
        let link = self.link_words(addr, with_return);
        self.set_relocation_mark();
        self.emit(&link)?;
        self.clear_relocation_mark();
        Ok(())
    }

    /// Ends a stream executed through a returning link.
    pub fn emit_return(&mut self) -> Result<()> {
        debug_assert_ne!(self.ty, StreamType::Compute, "compute streams cannot return");
        self.set_relocation_mark();
        self.emit(&vdm::stream_return())?;
        self.clear_relocation_mark();
        Ok(())
    }

    /// Ends the stream.
    pub fn emit_terminate(&mut self) -> Result<()> {
        debug_assert_ne!(
            self.ty,
            StreamType::GraphicsDeferred,
            "deferred streams are copied, not terminated"
        );
        let words = match self.ty {
            StreamType::Compute => cdm::stream_terminate(),
            _ => vdm::stream_terminate(),
        };
        self.set_relocation_mark();
        self.emit(&words)?;
        self.clear_relocation_mark();
        Ok(())
    }

    /// Appends the contents of a deferred stream. Returns the slot the words were copied to.
    pub fn copy_from(&mut self, src: &ControlStream) -> Result<Slot> {
        debug_assert_eq!(src.ty, StreamType::GraphicsDeferred);
        debug_assert_eq!(self.ty, StreamType::Graphics);
        self.set_relocation_mark();
        let slot = self.emit(&src.deferred)?;
        self.clear_relocation_mark();
        Ok(slot)
    }

    /// Address of the first word, invalid for an empty or host-side stream.
    pub fn start_addr(&self) -> DevAddr {
        self.blocks.first().map(|b| b.bo.addr()).unwrap_or(DevAddr::INVALID)
    }

    pub fn is_empty(&self) -> bool {
        self.len_words() == 0
    }

    /// Total number of words written, links included.
    pub fn len_words(&self) -> u32 {
        match self.ty {
            StreamType::GraphicsDeferred => self.deferred.len() as u32,
            _ => self.blocks.iter().map(|b| b.words.len() as u32).sum(),
        }
    }

    /// All words in execution order, links included.
    pub fn words(&self) -> Vec<u32> {
        match self.ty {
            StreamType::GraphicsDeferred => self.deferred.clone(),
            _ => self.blocks.iter().flat_map(|b| b.words.iter().copied()).collect(),
        }
    }

    /// Number of device blocks backing the stream.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Summary of the device memory backing the finished stream.
    pub fn bake(&self) -> BakedStream {
        BakedStream {
            ty: self.ty,
            start: self.start_addr(),
            blocks: self.blocks.iter().map(|b| b.bo.addr()).collect(),
            len_words: self.len_words(),
        }
    }

    /// Logs the stream contents.
    pub fn dump(&self) {
        for (i, block) in self.blocks.iter().enumerate() {
            trace!(stream = ?self.ty, block = i, addr = ?block.bo.addr(), words = ?block.words, "control stream");
        }
        if self.ty == StreamType::GraphicsDeferred {
            trace!(words = ?self.deferred, "deferred control stream");
        }
    }
}

impl fmt::Debug for ControlStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlStream")
            .field("ty", &self.ty)
            .field("blocks", &self.blocks.len())
            .field("len_words", &self.len_words())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn marked_region_stays_contiguous_across_blocks() {
        let device = testing::device();
        let mut cs = ControlStream::new(&device, StreamType::Graphics);
        let block_words = (CSB_BLOCK_SIZE / 4) as u32;

        // fill the first block up to a few words before the end
        let filler = vec![0x1111_1111; (block_words - vdm::LINK_WORDS - 3) as usize];
        cs.emit(&filler).unwrap();
        assert_eq!(cs.block_count(), 1);

        cs.set_relocation_mark();
        cs.emit(&[0xa, 0xb]).unwrap();
        cs.emit(&[0xc, 0xd, 0xe]).unwrap();
        cs.clear_relocation_mark();
        assert_eq!(cs.block_count(), 2);

        let words = cs.words();
        let link_at = filler.len();
        assert_eq!(vdm::block_type(words[link_at]), vdm::STREAM_LINK);
        assert_eq!(&words[link_at + 2..link_at + 7], &[0xa, 0xb, 0xc, 0xd, 0xe]);
        assert_eq!(cs.mark_status(), RelocationMark::Cleared);
    }

    #[test]
    fn deferred_stream_is_copied() {
        let device = testing::device();
        let mut secondary = ControlStream::new(&device, StreamType::GraphicsDeferred);
        secondary.emit(&[1, 2, 3]).unwrap();
        assert_eq!(secondary.start_addr(), DevAddr::INVALID);

        let mut primary = ControlStream::new(&device, StreamType::Graphics);
        primary.emit(&[9]).unwrap();
        let slot = primary.copy_from(&secondary).unwrap();
        assert_eq!(slot.offset(), 1);
        assert_eq!(slot.len(), 3);
        primary.write(slot.sub(1, 1), &[7]);
        primary.emit_terminate().unwrap();

        let words = primary.words();
        assert_eq!(&words[..4], &[9, 1, 7, 3]);
        assert_eq!(vdm::block_type(words[4]), vdm::STREAM_TERMINATE);
        assert!(primary.start_addr().is_valid());
    }

    #[test]
    fn oversized_allocation_gets_its_own_block() {
        let device = testing::device();
        let mut cs = ControlStream::new(&device, StreamType::Compute);
        let big = vec![5; (CSB_BLOCK_SIZE / 4) as usize + 10];
        cs.emit(&big).unwrap();
        cs.emit_terminate().unwrap();
        assert_eq!(cs.block_count(), 1);
        assert_eq!(cs.len_words() as usize, big.len() + 1);
    }
}
