// SPDX-License-Identifier: Apache-2.0

//! Virtio block device.
//!
//! One request queue. Requests carry a 16-byte header `{type, _, sector}` in
//! the readable portion; data and a trailing status byte live in the
//! writable portion. At most one request is in flight at a time: when the
//! backend completes asynchronously, the drain loop is paused through
//! backpressure and restarted by the completion.

use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use virtio_bindings::bindings::virtio_blk::{
    VIRTIO_BLK_F_SEG_MAX, VIRTIO_BLK_ID_BYTES, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK,
    VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN,
    VIRTIO_BLK_T_OUT,
};
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;

use crate::bus::VirtioBus;
use crate::device::{DeviceParams, RecvOutcome, VirtioBackend};
use crate::queue::DescChain;
use crate::{Error, Result, TYPE_BLOCK};

/// Legacy flush request type, treated exactly like VIRTIO_BLK_T_FLUSH.
const VIRTIO_BLK_T_FLUSH_OUT: u32 = 5;

pub const SECTOR_SIZE: usize = 512;

/// Identity returned for GET_ID requests, padded with zeros to 20 bytes.
const DISK_ID: &[u8] = b"tinyemu-virtio-blk";

/// Maximum number of segments advertised through the config space.
const CONFIG_MAX_SEG: u32 = 64;

/// One request handed to the backend.
pub enum DiskRequest {
    /// Fill `buf` from the disk starting at `sector`.
    Read { sector: u64, buf: Vec<u8> },
    /// Write `data` to the disk starting at `sector`.
    Write { sector: u64, data: Vec<u8> },
}

/// Continuation completing an in-flight request. Synchronous backends call
/// [`complete`](DiskCompletion::complete) before returning from `submit`;
/// asynchronous ones stash the completion and call it from their own thread.
pub struct DiskCompletion {
    chain: DescChain,
    write_size: u32,
    req_in_progress: Arc<AtomicBool>,
    requeue: Requeue,
}

struct Requeue {
    dev: Arc<Mutex<Weak<crate::device::VirtioMmioDevice>>>,
    queue_idx: u16,
}

impl Requeue {
    fn kick(&self) {
        if let Some(dev) = self.dev.lock().unwrap().upgrade() {
            dev.notify_queue(self.queue_idx);
        }
    }
}

impl DiskCompletion {
    /// Publishes the request's used-ring entry with the status derived from
    /// `result`, clears the in-flight flag and restarts the queue.
    pub fn complete(self, req: DiskRequest, result: io::Result<()>) {
        if let Err(e) = &result {
            warn!("virtio-blk: backend error: {}", e);
        }
        let status = if result.is_ok() {
            VIRTIO_BLK_S_OK as u8
        } else {
            VIRTIO_BLK_S_IOERR as u8
        };

        let published: Result<()> = match req {
            DiskRequest::Read { buf, .. } => self
                .chain
                .write_to(0, &buf)
                .and_then(|_| {
                    self.chain
                        .write_to(self.write_size as usize - 1, &[status])
                })
                .and_then(|_| self.chain.publish(self.write_size)),
            DiskRequest::Write { .. } => self
                .chain
                .write_to(0, &[status])
                .and_then(|_| self.chain.publish(1)),
        };
        if let Err(e) = published {
            debug!("virtio-blk: dropping completion: {}", e);
        }

        self.req_in_progress.store(false, Ordering::Release);
        self.requeue.kick();
    }
}

/// Storage behind the block device.
pub trait DiskBackend: Send + 'static {
    fn capacity_sectors(&self) -> u64;

    /// Processes `req` and eventually resolves it through `done`.
    fn submit(&mut self, req: DiskRequest, done: DiskCompletion);
}

struct VirtioBlock {
    disk: Box<dyn DiskBackend>,
    req_in_progress: Arc<AtomicBool>,
    requeue_dev: Arc<Mutex<Weak<crate::device::VirtioMmioDevice>>>,
}

impl VirtioBlock {
    fn completion(&self, chain: DescChain) -> DiskCompletion {
        DiskCompletion {
            write_size: chain.write_size,
            req_in_progress: self.req_in_progress.clone(),
            requeue: Requeue {
                dev: self.requeue_dev.clone(),
                queue_idx: chain.queue_idx,
            },
            chain,
        }
    }
}

impl VirtioBackend for VirtioBlock {
    fn recv(&mut self, chain: DescChain) -> Result<RecvOutcome> {
        if self.req_in_progress.load(Ordering::Acquire) {
            return Ok(RecvOutcome::Backpressure);
        }
        if chain.read_size < 16 || chain.write_size < 1 {
            return Err(Error::DescriptorChainTooShort);
        }

        let mut header = [0u8; 16];
        chain.read_from(0, &mut header)?;
        let req_type = LittleEndian::read_u32(&header[0..4]);
        let sector = LittleEndian::read_u64(&header[8..16]);
        let write_size = chain.write_size as usize;

        match req_type {
            VIRTIO_BLK_T_IN => {
                let len = (write_size - 1) / SECTOR_SIZE * SECTOR_SIZE;
                let buf = vec![0u8; len];
                self.req_in_progress.store(true, Ordering::Release);
                let done = self.completion(chain);
                self.disk.submit(DiskRequest::Read { sector, buf }, done);
            }
            VIRTIO_BLK_T_OUT => {
                let len = chain.read_size as usize - 16;
                let mut data = vec![0u8; len];
                chain.read_from(16, &mut data)?;
                self.req_in_progress.store(true, Ordering::Release);
                let done = self.completion(chain);
                self.disk.submit(DiskRequest::Write { sector, data }, done);
            }
            VIRTIO_BLK_T_FLUSH | VIRTIO_BLK_T_FLUSH_OUT => {
                // Nothing is cached, so a flush completes on the spot.
                chain.write_to(write_size - 1, &[VIRTIO_BLK_S_OK as u8])?;
                chain.publish(write_size as u32)?;
            }
            VIRTIO_BLK_T_GET_ID => {
                let mut buf = vec![0u8; write_size];
                let id_len = std::cmp::min(
                    std::cmp::min(DISK_ID.len(), VIRTIO_BLK_ID_BYTES as usize),
                    write_size - 1,
                );
                buf[..id_len].copy_from_slice(&DISK_ID[..id_len]);
                buf[write_size - 1] = VIRTIO_BLK_S_OK as u8;
                chain.write_to(0, &buf)?;
                chain.publish(write_size as u32)?;
            }
            other => {
                debug!("virtio-blk: unsupported request type {}", other);
                chain.write_to(0, &[VIRTIO_BLK_S_UNSUPP as u8])?;
                chain.publish(1)?;
            }
        }
        Ok(RecvOutcome::Done)
    }
}

/// Handle to a registered block device.
pub struct BlockDevice {
    dev: Arc<crate::device::VirtioMmioDevice>,
}

impl BlockDevice {
    /// Creates a block device over `disk` on the next free bus slot.
    pub fn create(bus: &mut VirtioBus, disk: Box<dyn DiskBackend>) -> Result<BlockDevice> {
        let capacity = disk.capacity_sectors();
        let mut config_space = vec![0u8; 16];
        LittleEndian::write_u64(&mut config_space[0..8], capacity);
        // max_size stays 0: SIZE_MAX is not offered.
        LittleEndian::write_u32(&mut config_space[12..16], CONFIG_MAX_SEG);

        let features = (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_BLK_F_SEG_MAX);
        let params = DeviceParams::new("virtio-blk", TYPE_BLOCK, features, config_space);

        let req_in_progress = Arc::new(AtomicBool::new(false));
        let requeue_dev = Arc::new(Mutex::new(Weak::new()));
        let backend = VirtioBlock {
            disk,
            req_in_progress,
            requeue_dev: requeue_dev.clone(),
        };
        let dev = bus.register(params, Box::new(backend))?;
        *requeue_dev.lock().unwrap() = Arc::downgrade(&dev);
        Ok(BlockDevice { dev })
    }

    pub fn device(&self) -> &Arc<crate::device::VirtioMmioDevice> {
        &self.dev
    }
}

/// Disk backed by host memory.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(sectors: u64) -> Self {
        MemDisk {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }

    pub fn from_image(data: Vec<u8>) -> Self {
        MemDisk { data }
    }

    fn span(&self, sector: u64, len: usize) -> io::Result<usize> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start.checked_add(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "request beyond disk end")
        })?;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request beyond disk end",
            ));
        }
        Ok(start)
    }
}

impl DiskBackend for MemDisk {
    fn capacity_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn submit(&mut self, mut req: DiskRequest, done: DiskCompletion) {
        let result = match &mut req {
            DiskRequest::Read { sector, buf } => self.span(*sector, buf.len()).map(|start| {
                let len = buf.len();
                buf.copy_from_slice(&self.data[start..start + len]);
            }),
            DiskRequest::Write { sector, data } => self.span(*sector, data.len()).map(|start| {
                self.data[start..start + data.len()].copy_from_slice(data);
            }),
        };
        done.complete(req, result);
    }
}

/// Disk backed by a host file, completing synchronously.
pub struct FileDisk {
    file: std::fs::File,
    sectors: u64,
}

impl FileDisk {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            warn!(
                "virtio-blk: disk size {} is not a multiple of the sector size; \
                 the tail will not be visible to the guest",
                len
            );
        }
        Ok(FileDisk {
            file,
            sectors: len / SECTOR_SIZE as u64,
        })
    }
}

impl DiskBackend for FileDisk {
    fn capacity_sectors(&self) -> u64 {
        self.sectors
    }

    fn submit(&mut self, mut req: DiskRequest, done: DiskCompletion) {
        let result = match &mut req {
            DiskRequest::Read { sector, buf } => self
                .file
                .seek(SeekFrom::Start(*sector * SECTOR_SIZE as u64))
                .and_then(|_| self.file.read_exact(buf)),
            DiskRequest::Write { sector, data } => self
                .file
                .seek(SeekFrom::Start(*sector * SECTOR_SIZE as u64))
                .and_then(|_| self.file.write_all(data)),
        };
        done.complete(req, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::IrqVector;
    use crate::memory::GuestMemory;
    use crate::tests::*;

    const VERSION_1: u64 = 1u64 << VIRTIO_F_VERSION_1;

    fn block_setup(
        disk: Box<dyn DiskBackend>,
    ) -> (
        BlockDevice,
        Arc<crate::tests::TestMemory>,
        GuestQueue,
    ) {
        let mem = test_mem(0x100000);
        let mut bus = VirtioBus::new(mem.clone() as Arc<dyn GuestMemory>, Arc::new(IrqVector::new()));
        let blk = BlockDevice::create(&mut bus, disk).unwrap();
        negotiate(blk.device(), VERSION_1 | 0x4);
        let gq = GuestQueue::new(0x1000, 16);
        setup_queue(blk.device(), 0, &gq);
        (blk, mem, gq)
    }

    fn write_header(mem: &dyn GuestMemory, addr: u64, req_type: u32, sector: u64) {
        let mut header = [0u8; 16];
        LittleEndian::write_u32(&mut header[0..4], req_type);
        LittleEndian::write_u64(&mut header[8..16], sector);
        mem.dma_write(addr, &header).unwrap();
    }

    #[test]
    fn test_config_space_capacity() {
        let (blk, _, _) = block_setup(Box::new(MemDisk::new(128)));
        let mut cfg = [0u8; 16];
        blk.device().read_config(0, &mut cfg).unwrap();
        assert_eq!(LittleEndian::read_u64(&cfg[0..8]), 128);
        assert_eq!(LittleEndian::read_u32(&cfg[8..12]), 0);
        assert_eq!(LittleEndian::read_u32(&cfg[12..16]), 64);
    }

    #[test]
    fn test_get_id() {
        let (blk, mem, mut gq) = block_setup(Box::new(MemDisk::new(8)));
        gq.add_chain(&*mem, 0x2000, &[(16, false), (21, true)]);
        write_header(&*mem, 0x2000, VIRTIO_BLK_T_GET_ID, 0);

        blk.device().drain_queue(0).unwrap();

        assert_eq!(gq.used_idx(&*mem), 1);
        assert_eq!(gq.used_elem(&*mem, 0), (0, 21));
        let mut out = [0u8; 21];
        mem.dma_read(0x2010, &mut out).unwrap();
        assert_eq!(&out[..18], b"tinyemu-virtio-blk");
        assert_eq!(out[18], 0);
        assert_eq!(out[19], 0);
        assert_eq!(out[20], VIRTIO_BLK_S_OK as u8);
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (blk, mem, mut gq) = block_setup(Box::new(MemDisk::new(8)));

        // OUT: header + one sector of payload, one writable status byte.
        gq.add_chain(&*mem, 0x2000, &[(16 + 512, false), (1, true)]);
        write_header(&*mem, 0x2000, VIRTIO_BLK_T_OUT, 2);
        let payload: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        mem.dma_write(0x2010, &payload).unwrap();

        blk.device().drain_queue(0).unwrap();
        assert_eq!(gq.used_idx(&*mem), 1);
        assert_eq!(gq.used_elem(&*mem, 0), (0, 1));
        let mut status = [0xffu8];
        mem.dma_read(0x2000 + 16 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK as u8);

        // IN: read the sector back into a 513-byte writable area.
        gq.add_chain(&*mem, 0x4000, &[(16, false), (513, true)]);
        write_header(&*mem, 0x4000, VIRTIO_BLK_T_IN, 2);

        blk.device().drain_queue(0).unwrap();
        assert_eq!(gq.used_idx(&*mem), 2);
        let mut readback = vec![0u8; 513];
        mem.dma_read(0x4010, &mut readback).unwrap();
        assert_eq!(&readback[..512], &payload[..]);
        assert_eq!(readback[512], VIRTIO_BLK_S_OK as u8);
    }

    #[test]
    fn test_read_beyond_capacity_reports_ioerr() {
        let (blk, mem, mut gq) = block_setup(Box::new(MemDisk::new(1)));
        gq.add_chain(&*mem, 0x2000, &[(16, false), (513, true)]);
        write_header(&*mem, 0x2000, VIRTIO_BLK_T_IN, 5);

        blk.device().drain_queue(0).unwrap();
        assert_eq!(gq.used_idx(&*mem), 1);
        let mut status = [0u8];
        mem.dma_read(0x2010 + 512, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_IOERR as u8);
    }

    #[test]
    fn test_flush_completes_immediately() {
        let (blk, mem, mut gq) = block_setup(Box::new(MemDisk::new(8)));
        gq.add_chain(&*mem, 0x2000, &[(16, false), (1, true)]);
        write_header(&*mem, 0x2000, VIRTIO_BLK_T_FLUSH, 0);

        blk.device().drain_queue(0).unwrap();
        assert_eq!(gq.used_idx(&*mem), 1);
        let mut status = [0xffu8];
        mem.dma_read(0x2010, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK as u8);
    }

    #[test]
    fn test_unsupported_type() {
        let (blk, mem, mut gq) = block_setup(Box::new(MemDisk::new(8)));
        gq.add_chain(&*mem, 0x2000, &[(16, false), (8, true)]);
        write_header(&*mem, 0x2000, 0x42, 0);

        blk.device().drain_queue(0).unwrap();
        assert_eq!(gq.used_idx(&*mem), 1);
        assert_eq!(gq.used_elem(&*mem, 0), (0, 1));
        let mut status = [0u8];
        mem.dma_read(0x2010, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_UNSUPP as u8);
    }

    /// Backend that parks the first request until released, as an async
    /// backend would.
    struct ParkedDisk {
        inner: MemDisk,
        parked_once: bool,
        parked: Arc<Mutex<Option<(DiskRequest, DiskCompletion)>>>,
    }

    impl DiskBackend for ParkedDisk {
        fn capacity_sectors(&self) -> u64 {
            self.inner.capacity_sectors()
        }

        fn submit(&mut self, req: DiskRequest, done: DiskCompletion) {
            if !self.parked_once {
                self.parked_once = true;
                *self.parked.lock().unwrap() = Some((req, done));
            } else {
                self.inner.submit(req, done);
            }
        }
    }

    #[test]
    fn test_async_backpressure_and_restart() {
        let parked = Arc::new(Mutex::new(None));
        let (blk, mem, mut gq) = block_setup(Box::new(ParkedDisk {
            inner: MemDisk::new(8),
            parked_once: false,
            parked: parked.clone(),
        }));

        // Two one-sector reads; descriptor indices 0..2 and 2..4.
        gq.write_desc(&*mem, 0, 0x2000, 16, crate::queue::VIRTQ_DESC_F_NEXT, 1);
        gq.write_desc(&*mem, 1, 0x2100, 513, crate::queue::VIRTQ_DESC_F_WRITE, 0);
        gq.write_desc(&*mem, 2, 0x3000, 16, crate::queue::VIRTQ_DESC_F_NEXT, 3);
        gq.write_desc(&*mem, 3, 0x3100, 513, crate::queue::VIRTQ_DESC_F_WRITE, 0);
        write_header(&*mem, 0x2000, VIRTIO_BLK_T_IN, 0);
        write_header(&*mem, 0x3000, VIRTIO_BLK_T_IN, 1);
        gq.push_avail(&*mem, 0);
        gq.push_avail(&*mem, 2);

        blk.device().drain_queue(0).unwrap();
        // First request parked, second held back by the in-flight request.
        assert_eq!(gq.used_idx(&*mem), 0);

        let (req, done) = parked.lock().unwrap().take().unwrap();
        done.complete(req, Ok(()));
        assert_eq!(gq.used_idx(&*mem), 1);

        // The completion re-armed the queue for the notification worker.
        assert_eq!(blk.device().take_pending_notify(), 1);
        blk.device().drain_queue(0).unwrap();
        assert_eq!(gq.used_idx(&*mem), 2);
    }
}
