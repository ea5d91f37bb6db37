// SPDX-License-Identifier: Apache-2.0

//! Split virtqueue engine: descriptor fetch, chain walking, copy helpers and
//! used-ring publication.
//!
//! Ring layout per VirtIO 1.0, little-endian:
//!
//! - descriptor table: `size` x 16 bytes `{addr: u64, len: u32, flags: u16, next: u16}`
//! - available ring: `{flags: u16, idx: u16, ring: [u16; size], used_event: u16}`
//! - used ring: `{flags: u16, idx: u16, ring: [{id: u32, len: u32}; size], avail_event: u16}`

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::irq::{InterruptStatusRegister32, IrqLine};
use crate::memory::GuestMemory;
use crate::{Error, Result, MAX_QUEUE_NUM, VIRTIO_INTR_VRING};

/// Continue the chain through the `next` field.
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
/// Buffer is device write-only (otherwise device read-only).
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
/// Buffer contains a table of indirect descriptors. Not negotiated.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

const DESC_SIZE: u64 = 16;

/// One entry of the descriptor table, as read from guest memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// Host-side state of one virtqueue.
///
/// When `ready` is set by the driver, the three ring pointers are non-null
/// and the size is fixed. `last_avail_idx` and `cached_avail_idx` wrap modulo
/// 2^16 and satisfy `last_avail_idx <= cached_avail_idx` in the wrapping
/// sense.
#[derive(Clone, Copy, Debug)]
pub struct QueueState {
    pub ready: bool,
    pub size: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// Next available-ring slot the device will consume.
    pub last_avail_idx: u16,
    /// Last value read from the available-ring head.
    pub cached_avail_idx: u16,
    /// If set, notifications do not trigger automatic descriptor consumption;
    /// the device polls the queue in response to external events instead.
    pub manual_recv: bool,
}

impl Default for QueueState {
    fn default() -> Self {
        QueueState {
            ready: false,
            size: MAX_QUEUE_NUM,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            last_avail_idx: 0,
            cached_avail_idx: 0,
            manual_recv: false,
        }
    }
}

impl QueueState {
    /// Returns the queue to its post-construction state. The `manual_recv`
    /// flag is part of the device's immutable layout and survives resets.
    pub fn reset(&mut self) {
        let manual_recv = self.manual_recv;
        *self = QueueState::default();
        self.manual_recv = manual_recv;
    }

    /// True when there are published entries the device has not consumed.
    pub fn has_available(&self) -> bool {
        self.last_avail_idx != self.cached_avail_idx
    }

    pub fn rings(&self) -> QueueRings {
        QueueRings {
            size: self.size,
            desc_addr: self.desc_addr,
            avail_addr: self.avail_addr,
            used_addr: self.used_addr,
        }
    }
}

/// Copy of a queue's ring geometry, detached from the device lock so ring
/// traversal can run concurrently with register accesses.
#[derive(Clone, Copy, Debug)]
pub struct QueueRings {
    pub size: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
}

impl QueueRings {
    fn mask(&self) -> u16 {
        self.size.wrapping_sub(1)
    }

    /// Fetches descriptor `index` from the descriptor table.
    pub fn desc_at(&self, mem: &dyn GuestMemory, index: u16) -> Result<Descriptor> {
        let mut raw = [0u8; DESC_SIZE as usize];
        mem.dma_read(self.desc_addr + DESC_SIZE * index as u64, &mut raw)?;
        Ok(Descriptor {
            addr: LittleEndian::read_u64(&raw[0..8]),
            len: LittleEndian::read_u32(&raw[8..12]),
            flags: LittleEndian::read_u16(&raw[12..14]),
            next: LittleEndian::read_u16(&raw[14..16]),
        })
    }

    /// Reads the available ring head index published by the driver.
    pub fn avail_idx(&self, mem: &dyn GuestMemory) -> Result<u16> {
        mem.read_u16(self.avail_addr + 2)
    }

    /// Reads the descriptor index stored in available-ring slot `slot`.
    pub fn avail_entry(&self, mem: &dyn GuestMemory, slot: u16) -> Result<u16> {
        mem.read_u16(self.avail_addr + 4 + 2 * (slot & self.mask()) as u64)
    }

    fn next_desc(
        &self,
        mem: &dyn GuestMemory,
        desc: &Descriptor,
        hops: &mut u16,
    ) -> Result<Descriptor> {
        *hops += 1;
        if *hops >= self.size {
            return Err(Error::DescriptorChainTooLong);
        }
        self.desc_at(mem, desc.next)
    }

    /// Computes the readable and writable byte counts of the chain starting
    /// at `head`: the sum of leading device-readable descriptors followed by
    /// the sum of trailing device-writable ones. A readable descriptor after
    /// a writable one is a protocol error and fails the whole chain.
    pub fn chain_rw_size(&self, mem: &dyn GuestMemory, head: u16) -> Result<(u32, u32)> {
        let mut read_size = 0u32;
        let mut write_size = 0u32;
        let mut hops = 0u16;
        let mut desc = self.desc_at(mem, head)?;

        loop {
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(Error::IndirectDescriptor);
            }
            if desc.is_write_only() {
                break;
            }
            read_size = read_size.wrapping_add(desc.len);
            if !desc.has_next() {
                return Ok((read_size, write_size));
            }
            desc = self.next_desc(mem, &desc, &mut hops)?;
        }

        loop {
            if !desc.is_write_only() {
                return Err(Error::UnexpectedReadOnlyDescriptor);
            }
            write_size = write_size.wrapping_add(desc.len);
            if !desc.has_next() {
                break;
            }
            desc = self.next_desc(mem, &desc, &mut hops)?;
        }

        Ok((read_size, write_size))
    }

    /// Copies `buf.len()` bytes out of the chain's readable portion, starting
    /// at logical `offset`, walking descriptors as needed.
    pub fn copy_from_chain(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let count = buf.len();
        self.chain_copy(mem, head, offset, count, false, &mut |addr, pos, len| {
            mem.dma_read(addr, &mut buf[pos..pos + len])
        })
    }

    /// Copies `buf` into the chain's writable portion at logical `offset`.
    pub fn copy_to_chain(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
        offset: usize,
        buf: &[u8],
    ) -> Result<()> {
        let count = buf.len();
        self.chain_copy(mem, head, offset, count, true, &mut |addr, pos, len| {
            mem.dma_write(addr, &buf[pos..pos + len])
        })
    }

    /// Walks the chain to the portion selected by `writable`, seeks to
    /// logical `offset` within it and transfers `count` bytes through `xfer`,
    /// crossing descriptor boundaries as needed.
    fn chain_copy(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
        mut offset: usize,
        count: usize,
        writable: bool,
        xfer: &mut dyn FnMut(u64, usize, usize) -> Result<()>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let mut hops = 0u16;
        let mut desc = self.desc_at(mem, head)?;

        if writable {
            // Seek past the readable prefix to the first writable descriptor.
            while !desc.is_write_only() {
                if !desc.has_next() {
                    return Err(Error::DescriptorChainTooShort);
                }
                desc = self.next_desc(mem, &desc, &mut hops)?;
            }
        }

        // Seek to the descriptor containing `offset`.
        loop {
            if desc.is_write_only() != writable {
                return Err(if writable {
                    Error::UnexpectedReadOnlyDescriptor
                } else {
                    Error::UnexpectedWriteOnlyDescriptor
                });
            }
            if offset < desc.len as usize {
                break;
            }
            if !desc.has_next() {
                return Err(Error::DescriptorChainTooShort);
            }
            offset -= desc.len as usize;
            desc = self.next_desc(mem, &desc, &mut hops)?;
        }

        let mut done = 0usize;
        loop {
            let len = std::cmp::min(count - done, desc.len as usize - offset);
            xfer(desc.addr + offset as u64, done, len)?;
            done += len;
            if done == count {
                return Ok(());
            }
            offset += len;
            if offset == desc.len as usize {
                if !desc.has_next() {
                    return Err(Error::DescriptorChainTooShort);
                }
                desc = self.next_desc(mem, &desc, &mut hops)?;
                if desc.is_write_only() != writable {
                    return Err(if writable {
                        Error::UnexpectedReadOnlyDescriptor
                    } else {
                        Error::UnexpectedWriteOnlyDescriptor
                    });
                }
                offset = 0;
            }
        }
    }

    /// Publishes a completed chain on the used ring: stores
    /// `{desc_idx, written}` into the next slot, issues a release fence, then
    /// increments `used.idx` so the guest never observes a new index with a
    /// stale entry.
    pub fn publish_used(&self, mem: &dyn GuestMemory, desc_idx: u16, written: u32) -> Result<()> {
        let used_idx_addr = self.used_addr + 2;
        let used_idx = mem.read_u16(used_idx_addr)?;

        let elem_addr = self.used_addr + 4 + 8 * (used_idx & self.mask()) as u64;
        mem.write_u32(elem_addr, desc_idx as u32)?;
        mem.write_u32(elem_addr + 4, written)?;

        fence(Ordering::Release);
        mem.write_u16(used_idx_addr, used_idx.wrapping_add(1))
    }
}

/// A descriptor chain handed to a device's receive callback, bundling
/// everything needed to service it: the DMA gateway, the ring geometry, the
/// precomputed readable/writable sizes and the device's interrupt line.
///
/// The chain is `Send`, so devices with asynchronous backends can carry it
/// into a completion and publish from another thread.
pub struct DescChain {
    mem: Arc<dyn GuestMemory>,
    rings: QueueRings,
    intr_status: Arc<InterruptStatusRegister32>,
    irq: IrqLine,
    /// Queue the chain came from.
    pub queue_idx: u16,
    /// Head descriptor index.
    pub head: u16,
    /// Total bytes in the device-readable portion.
    pub read_size: u32,
    /// Total bytes in the device-writable portion.
    pub write_size: u32,
}

impl DescChain {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mem: Arc<dyn GuestMemory>,
        rings: QueueRings,
        intr_status: Arc<InterruptStatusRegister32>,
        irq: IrqLine,
        queue_idx: u16,
        head: u16,
        read_size: u32,
        write_size: u32,
    ) -> Self {
        DescChain {
            mem,
            rings,
            intr_status,
            irq,
            queue_idx,
            head,
            read_size,
            write_size,
        }
    }

    /// Copies from the readable portion at logical `offset` into `buf`.
    pub fn read_from(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.rings
            .copy_from_chain(&*self.mem, self.head, offset, buf)
    }

    /// Copies `buf` into the writable portion at logical `offset`.
    pub fn write_to(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.rings.copy_to_chain(&*self.mem, self.head, offset, buf)
    }

    /// Publishes the chain on the used ring with `written` bytes, latches the
    /// used-ring interrupt status bit and raises the device's interrupt line.
    pub fn publish(&self, written: u32) -> Result<()> {
        self.rings
            .publish_used(&*self.mem, self.head, written)?;
        self.intr_status.set_bits(VIRTIO_INTR_VRING);
        self.irq.raise();
        Ok(())
    }
}
