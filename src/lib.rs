// SPDX-License-Identifier: Apache-2.0

//! Core of a userspace device-emulation bridge backing a hardware RISC-V
//! guest with software-emulated MMIO peripherals.
//!
//! The guest issues memory-mapped reads and writes over a "virtual device"
//! interface exposed through kernel character devices. This crate intercepts
//! each transaction, routes it to the owning emulated peripheral, performs
//! DMA against a coherent memory window shared with the guest, and drives
//! level-triggered interrupt lines back. The peripherals implement the
//! VirtIO 1.0 MMIO transport plus block, network, console, entropy, input
//! and 9P device classes, next to an HTIF console/exit path and the SiFive
//! test finisher.
//!
//! Please refer to [Virtio Specification]
//! (http://docs.oasis-open.org/virtio/virtio/v1.0/cs04/virtio-v1.0-cs04.html)
//! for more information.

pub mod bus;
pub mod device;
pub mod devices;
pub mod irq;
pub mod memory;
pub mod notifier;
pub mod queue;
pub mod router;

pub use self::bus::VirtioBus;
pub use self::device::VirtioMmioDevice;
pub use self::irq::{InterruptStatusRegister32, IrqController, IrqLine};
pub use self::memory::GuestMemory;
pub use self::notifier::QueueNotifier;
pub use self::router::{StopCode, StopLatch, TransactionRouter};

use std::io::Error as IOError;

/// Initial state after device initialization/reset.
pub const DEVICE_INIT: u32 = 0x0;
/// Indicates that the guest OS has found the device and recognized it as a valid virtio device.
pub const DEVICE_ACKNOWLEDGE: u32 = 0x01;
/// Indicates that the guest OS knows how to drive the device.
pub const DEVICE_DRIVER: u32 = 0x02;
/// Indicates that the driver is set up and ready to drive the device.
pub const DEVICE_DRIVER_OK: u32 = 0x04;
/// Indicates that the driver has acknowledged all the features it understands, and feature
/// negotiation is complete.
pub const DEVICE_FEATURES_OK: u32 = 0x08;
/// Indicates that the device has experienced an error from which it can't recover.
pub const DEVICE_NEEDS_RESET: u32 = 0x40;
/// Indicates that something went wrong in the guest, and it has given up on the device.
pub const DEVICE_FAILED: u32 = 0x80;

/// Virtio network card device.
pub const TYPE_NET: u32 = 1;
/// Virtio block device.
pub const TYPE_BLOCK: u32 = 2;
/// Virtio console device.
pub const TYPE_CONSOLE: u32 = 3;
/// Virtio-rng device.
pub const TYPE_RNG: u32 = 4;
/// Virtio 9P transport device.
pub const TYPE_9P: u32 = 9;
/// Virtio input device.
pub const TYPE_INPUT: u32 = 18;

// Interrupt status flags for legacy interrupts.
/// Data available in used queue.
pub const VIRTIO_INTR_VRING: u32 = 0x01;
/// Device configuration changed.
pub const VIRTIO_INTR_CONFIG: u32 = 0x02;

/// Number of virtqueues allocated per device.
pub const MAX_QUEUE: usize = 8;
/// Maximum number of entries in a single virtqueue.
pub const MAX_QUEUE_NUM: u16 = 16;
/// Maximum size of a device-specific configuration space, in bytes.
pub const MAX_CONFIG_SPACE_SIZE: usize = 256;

/// Error code for VirtioDevice::read_config()/write_config().
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("invalid offset: {0}.")]
    InvalidOffset(u64),
    #[error("invalid offset plus data length: {0}.")]
    InvalidOffsetPlusDataLen(u64),
}

/// Specialized std::result::Result for config space accesses.
pub type ConfigResult = std::result::Result<(), ConfigError>;

/// Error for virtio devices to handle requests from guests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Guest gave us too few descriptors in a descriptor chain.
    #[error("not enough descriptors for request.")]
    DescriptorChainTooShort,
    /// A descriptor chain has more links than the queue has entries.
    #[error("descriptor chain too long.")]
    DescriptorChainTooLong,
    /// Guest gave us a descriptor with the INDIRECT flag, which is not negotiated.
    #[error("indirect descriptors not supported.")]
    IndirectDescriptor,
    /// Guest gave us a write only descriptor that protocol says to read from.
    #[error("unexpected write only descriptor.")]
    UnexpectedWriteOnlyDescriptor,
    /// Guest gave us a read only descriptor that protocol says to write to.
    #[error("unexpected read only descriptor.")]
    UnexpectedReadOnlyDescriptor,
    /// Invalid input parameter or status.
    #[error("invalid input parameter or status.")]
    InvalidInput,
    /// An address range overlaps one already registered with the router.
    #[error("address range 0x{0:x} overlaps a registered range.")]
    RangeOverlap(u64),
    /// Guest gave us a bad physical address for DMA.
    #[error("failed to access guest memory at 0x{0:x}.")]
    GuestMemory(u64),
    /// Generic IO error.
    #[error("IO: {0}.")]
    IOError(#[from] IOError),
}

/// Specialized std::result::Result for virtio device operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
pub mod tests {
    use std::sync::{Arc, Mutex};

    use byteorder::{ByteOrder, LittleEndian};

    use crate::device::{
        VirtioMmioDevice, REG_MMIO_DRIVER_FEATURE, REG_MMIO_DRIVER_FEATURES_S,
        REG_MMIO_QUEUE_AVAIL_LOW, REG_MMIO_QUEUE_DESC_LOW, REG_MMIO_QUEUE_NUM,
        REG_MMIO_QUEUE_READY, REG_MMIO_QUEUE_SEL, REG_MMIO_QUEUE_USED_LOW, REG_MMIO_STATUS,
    };
    use crate::memory::GuestMemory;
    use crate::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
    use crate::{Error, Result, DEVICE_ACKNOWLEDGE, DEVICE_DRIVER, DEVICE_FEATURES_OK};

    /// Flat little-endian guest memory starting at physical address zero.
    pub struct TestMemory {
        data: Mutex<Vec<u8>>,
    }

    impl TestMemory {
        pub fn new(size: usize) -> Self {
            TestMemory {
                data: Mutex::new(vec![0u8; size]),
            }
        }
    }

    impl GuestMemory for TestMemory {
        fn dma_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
            let data = self.data.lock().unwrap();
            let start = addr as usize;
            let end = start
                .checked_add(buf.len())
                .ok_or(Error::GuestMemory(addr))?;
            if end > data.len() {
                return Err(Error::GuestMemory(addr));
            }
            buf.copy_from_slice(&data[start..end]);
            Ok(())
        }

        fn dma_write(&self, addr: u64, buf: &[u8]) -> Result<()> {
            let mut data = self.data.lock().unwrap();
            let start = addr as usize;
            let end = start
                .checked_add(buf.len())
                .ok_or(Error::GuestMemory(addr))?;
            if end > data.len() {
                return Err(Error::GuestMemory(addr));
            }
            data[start..end].copy_from_slice(buf);
            Ok(())
        }
    }

    /// Split virtqueue laid out in a [`TestMemory`], plus helpers to feed
    /// descriptor chains the way a guest driver would.
    pub struct GuestQueue {
        pub desc: u64,
        pub avail: u64,
        pub used: u64,
        pub size: u16,
        avail_count: u16,
    }

    impl GuestQueue {
        pub fn new(base: u64, size: u16) -> Self {
            let desc = base;
            let avail = desc + 16 * size as u64;
            let used = (avail + 6 + 2 * size as u64 + 3) & !3;
            GuestQueue {
                desc,
                avail,
                used,
                size,
                avail_count: 0,
            }
        }

        pub fn write_desc(
            &self,
            mem: &dyn GuestMemory,
            index: u16,
            addr: u64,
            len: u32,
            flags: u16,
            next: u16,
        ) {
            let mut raw = [0u8; 16];
            LittleEndian::write_u64(&mut raw[0..8], addr);
            LittleEndian::write_u32(&mut raw[8..12], len);
            LittleEndian::write_u16(&mut raw[12..14], flags);
            LittleEndian::write_u16(&mut raw[14..16], next);
            mem.dma_write(self.desc + 16 * index as u64, &raw).unwrap();
        }

        /// Writes a chain of (len, writable) buffers and pushes its head onto
        /// the available ring. Buffers are carved out of guest memory starting
        /// at `buf_base`. Returns the head descriptor index.
        pub fn add_chain(
            &mut self,
            mem: &dyn GuestMemory,
            buf_base: u64,
            bufs: &[(u32, bool)],
        ) -> u16 {
            let head = 0u16;
            let mut addr = buf_base;
            for (i, (len, writable)) in bufs.iter().enumerate() {
                let mut flags = 0u16;
                if *writable {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                if i + 1 < bufs.len() {
                    flags |= VIRTQ_DESC_F_NEXT;
                }
                self.write_desc(mem, i as u16, addr, *len, flags, (i + 1) as u16);
                addr += *len as u64;
            }
            self.push_avail(mem, head);
            head
        }

        pub fn push_avail(&mut self, mem: &dyn GuestMemory, desc_idx: u16) {
            let slot = self.avail_count % self.size;
            mem.write_u16(self.avail + 4 + 2 * slot as u64, desc_idx)
                .unwrap();
            self.avail_count = self.avail_count.wrapping_add(1);
            mem.write_u16(self.avail + 2, self.avail_count).unwrap();
        }

        pub fn used_idx(&self, mem: &dyn GuestMemory) -> u16 {
            mem.read_u16(self.used + 2).unwrap()
        }

        pub fn used_elem(&self, mem: &dyn GuestMemory, slot: u16) -> (u32, u32) {
            let addr = self.used + 4 + 8 * (slot % self.size) as u64;
            (mem.read_u32(addr).unwrap(), mem.read_u32(addr + 4).unwrap())
        }
    }

    pub fn mmio_write_u32(dev: &VirtioMmioDevice, offset: u64, val: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, val);
        dev.mmio_write(offset, &buf);
    }

    pub fn mmio_read_u32(dev: &VirtioMmioDevice, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        dev.mmio_read(offset, &mut buf);
        LittleEndian::read_u32(&buf)
    }

    /// Drives the driver side of feature negotiation up to FEATURES_OK.
    pub fn negotiate(dev: &VirtioMmioDevice, features: u64) {
        mmio_write_u32(dev, REG_MMIO_STATUS, DEVICE_ACKNOWLEDGE);
        mmio_write_u32(dev, REG_MMIO_STATUS, DEVICE_ACKNOWLEDGE | DEVICE_DRIVER);
        mmio_write_u32(dev, REG_MMIO_DRIVER_FEATURES_S, 0);
        mmio_write_u32(dev, REG_MMIO_DRIVER_FEATURE, features as u32);
        mmio_write_u32(dev, REG_MMIO_DRIVER_FEATURES_S, 1);
        mmio_write_u32(dev, REG_MMIO_DRIVER_FEATURE, (features >> 32) as u32);
        mmio_write_u32(
            dev,
            REG_MMIO_STATUS,
            DEVICE_ACKNOWLEDGE | DEVICE_DRIVER | DEVICE_FEATURES_OK,
        );
    }

    /// Programs ring addresses and size for `queue_idx` and marks it ready.
    pub fn setup_queue(dev: &VirtioMmioDevice, queue_idx: u32, gq: &GuestQueue) {
        mmio_write_u32(dev, REG_MMIO_QUEUE_SEL, queue_idx);
        mmio_write_u32(dev, REG_MMIO_QUEUE_NUM, gq.size as u32);
        mmio_write_u32(dev, REG_MMIO_QUEUE_DESC_LOW, gq.desc as u32);
        mmio_write_u32(dev, REG_MMIO_QUEUE_AVAIL_LOW, gq.avail as u32);
        mmio_write_u32(dev, REG_MMIO_QUEUE_USED_LOW, gq.used as u32);
        mmio_write_u32(dev, REG_MMIO_QUEUE_READY, 1);
    }

    pub fn test_mem(size: usize) -> Arc<TestMemory> {
        Arc::new(TestMemory::new(size))
    }
}
