// SPDX-License-Identifier: Apache-2.0

//! Implementation of the virtio MMIO transport layer, version 2.
//!
//! Each emulated peripheral owns one 4 KiB MMIO page: offsets below 0x100
//! form the standard register file, offsets from 0x100 address the
//! device-specific configuration space. The register file only accepts
//! 32-bit accesses; narrower or wider accesses read zero and are ignored on
//! write.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;

use crate::irq::{InterruptStatusRegister32, IrqLine};
use crate::memory::GuestMemory;
use crate::notifier::QueueNotifier;
use crate::queue::{DescChain, QueueState};
use crate::router::MmioHandler;
use crate::{
    ConfigError, ConfigResult, Error, Result, DEVICE_FEATURES_OK, MAX_CONFIG_SPACE_SIZE, MAX_QUEUE,
    MAX_QUEUE_NUM, VIRTIO_INTR_CONFIG,
};

/// Magic number for MMIO virtio devices ("virt").
pub const MMIO_MAGIC_VALUE: u32 = 0x7472_6976;
/// Version specified by the MMIO standard; legacy version 1 is not supported.
pub const MMIO_VERSION_2: u32 = 2;
/// Vendor ID reported when the device layout does not override it.
pub const MMIO_VENDOR_ID: u32 = 0xffff;
/// Size of an MMIO device window, registers plus config space.
pub const MMIO_PAGE_SIZE: u64 = 0x1000;

// Control registers.

// Magic value ("virt" string) - Read Only
pub const REG_MMIO_MAGIC_VALUE: u64 = 0x000;
// Virtio device version - Read Only
pub const REG_MMIO_VERSION: u64 = 0x004;
// Virtio device ID - Read Only
pub const REG_MMIO_DEVICE_ID: u64 = 0x008;
// Virtio vendor ID - Read Only
pub const REG_MMIO_VENDOR_ID: u64 = 0x00c;
// Bitmask of the features supported by the device (32 bits per set) - Read Only
pub const REG_MMIO_DEVICE_FEATURE: u64 = 0x010;
// Device (host) features set selector - Write Only
pub const REG_MMIO_DEVICE_FEATURES_S: u64 = 0x014;
// Bitmask of features activated by the driver (32 bits per set) - Write Only
pub const REG_MMIO_DRIVER_FEATURE: u64 = 0x020;
// Activated features set selector - Write Only
pub const REG_MMIO_DRIVER_FEATURES_S: u64 = 0x024;
// Queue selector - Write Only
pub const REG_MMIO_QUEUE_SEL: u64 = 0x030;
// Maximum size of the currently selected queue - Read Only
pub const REG_MMIO_QUEUE_NUM_MA: u64 = 0x034;
// Queue size for the currently selected queue - Write Only
pub const REG_MMIO_QUEUE_NUM: u64 = 0x038;
// Ready bit for the currently selected queue - Read Write
pub const REG_MMIO_QUEUE_READY: u64 = 0x044;
// Queue notifier - Write Only
pub const REG_MMIO_QUEUE_NOTIF: u64 = 0x050;
// Interrupt status - Read Only
pub const REG_MMIO_INTERRUPT_STAT: u64 = 0x060;
// Interrupt acknowledge - Write Only
pub const REG_MMIO_INTERRUPT_AC: u64 = 0x064;
// Device status register - Read Write
pub const REG_MMIO_STATUS: u64 = 0x070;
// Selected queue's Descriptor Table address, 64 bits in two halves
pub const REG_MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const REG_MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
// Selected queue's Available Ring address, 64 bits in two halves
pub const REG_MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const REG_MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
// Selected queue's Used Ring address, 64 bits in two halves
pub const REG_MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const REG_MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
// Configuration atomicity value
pub const REG_MMIO_CONFIG_GENERATI: u64 = 0x0fc;
// The device-specific configuration space starts here - Read Write
pub const REG_MMIO_CONFIG: u64 = 0x100;

/// What the receive callback asks the drain loop to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecvOutcome {
    /// Chain handled (or intentionally dropped); keep draining.
    Done,
    /// Stop draining without consuming the chain; the device will restart the
    /// queue once its in-flight request completes.
    Backpressure,
}

/// Per-class half of an emulated peripheral.
///
/// The transport invokes `recv` for every descriptor chain the guest posts
/// on an automatically drained queue, and `config_write` after every
/// successful config-space write.
pub trait VirtioBackend: Send {
    fn recv(&mut self, chain: DescChain) -> Result<RecvOutcome>;

    fn config_write(&mut self, _config: &mut [u8]) {}
}

/// Immutable identity and layout of a device, fixed at construction.
pub struct DeviceParams {
    pub name: String,
    pub device_id: u32,
    pub vendor_id: u32,
    pub device_features: u64,
    pub config_space: Vec<u8>,
    /// Queues whose drain loop never calls `recv`; the device polls them in
    /// response to external events instead.
    pub manual_queues: Vec<u16>,
}

impl DeviceParams {
    pub fn new(name: &str, device_id: u32, device_features: u64, config_space: Vec<u8>) -> Self {
        DeviceParams {
            name: name.to_string(),
            device_id,
            vendor_id: MMIO_VENDOR_ID,
            device_features,
            config_space,
            manual_queues: Vec::new(),
        }
    }

    pub fn with_manual_queues(mut self, queues: &[u16]) -> Self {
        self.manual_queues = queues.to_vec();
        self
    }
}

struct MmioState {
    status: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    queue_sel: u32,
    driver_features: u64,
    /// Locked in once the FEATURES_OK handshake succeeds; always contains
    /// VERSION_1 when non-zero. Cleared on reset.
    negotiated_features: u64,
    queues: [QueueState; MAX_QUEUE],
    config_space: Vec<u8>,
}

impl MmioState {
    fn selected_queue(&self) -> &QueueState {
        &self.queues[self.queue_sel as usize % MAX_QUEUE]
    }

    fn selected_queue_mut(&mut self) -> &mut QueueState {
        &mut self.queues[self.queue_sel as usize % MAX_QUEUE]
    }
}

/// One emulated peripheral behind the virtio MMIO transport.
pub struct VirtioMmioDevice {
    name: String,
    device_id: u32,
    vendor_id: u32,
    device_features: u64,
    mem: Arc<dyn GuestMemory>,
    irq: IrqLine,
    interrupt_status: Arc<InterruptStatusRegister32>,
    pending_notify: AtomicU32,
    notifier: QueueNotifier,
    state: Mutex<MmioState>,
    backend: Mutex<Box<dyn VirtioBackend>>,
}

impl VirtioMmioDevice {
    pub fn new(
        params: DeviceParams,
        backend: Box<dyn VirtioBackend>,
        mem: Arc<dyn GuestMemory>,
        irq: IrqLine,
        notifier: QueueNotifier,
    ) -> Result<Arc<Self>> {
        if params.config_space.len() > MAX_CONFIG_SPACE_SIZE {
            return Err(Error::InvalidInput);
        }
        let mut queues = [QueueState::default(); MAX_QUEUE];
        for q in params.manual_queues.iter() {
            let q = *q as usize;
            if q >= MAX_QUEUE {
                return Err(Error::InvalidInput);
            }
            queues[q].manual_recv = true;
        }

        Ok(Arc::new(VirtioMmioDevice {
            name: params.name,
            device_id: params.device_id,
            vendor_id: params.vendor_id,
            device_features: params.device_features,
            mem,
            irq,
            interrupt_status: Arc::new(InterruptStatusRegister32::new()),
            pending_notify: AtomicU32::new(0),
            notifier,
            state: Mutex::new(MmioState {
                status: 0,
                device_features_sel: 0,
                driver_features_sel: 0,
                queue_sel: 0,
                driver_features: 0,
                negotiated_features: 0,
                queues,
                config_space: params.config_space,
            }),
            backend: Mutex::new(backend),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn irq(&self) -> &IrqLine {
        &self.irq
    }

    pub fn interrupt_status(&self) -> Arc<InterruptStatusRegister32> {
        self.interrupt_status.clone()
    }

    pub fn guest_memory(&self) -> Arc<dyn GuestMemory> {
        self.mem.clone()
    }

    /// Features locked in by the FEATURES_OK handshake; 0 until then.
    pub fn negotiated_features(&self) -> u64 {
        self.state.lock().unwrap().negotiated_features
    }

    /// Marks queue `queue_idx` pending and wakes the notification worker.
    pub fn notify_queue(&self, queue_idx: u16) {
        self.pending_notify
            .fetch_or(1 << queue_idx, Ordering::Release);
        self.notifier.signal();
    }

    /// Atomically claims the pending-queue bitmap for draining. The exchange
    /// happens before any drain work so a concurrent notify is never lost.
    pub fn take_pending_notify(&self) -> u32 {
        self.pending_notify.swap(0, Ordering::Acquire)
    }

    /// Raises the config-change interrupt.
    pub fn signal_config_change(&self) {
        self.interrupt_status.set_bits(VIRTIO_INTR_CONFIG);
        self.irq.raise();
    }

    /// Runs `f` against the device's config space under the state lock and
    /// fires the config-change interrupt afterwards.
    pub fn update_config(&self, f: impl FnOnce(&mut [u8])) {
        {
            let mut state = self.state.lock().unwrap();
            f(&mut state.config_space);
        }
        self.signal_config_change();
    }

    /// Reads `data.len()` bytes from the config space at `offset`.
    pub fn read_config(&self, offset: u64, data: &mut [u8]) -> ConfigResult {
        let state = self.state.lock().unwrap();
        let len = state.config_space.len() as u64;
        if offset >= len {
            return Err(ConfigError::InvalidOffset(offset));
        }
        if offset + data.len() as u64 > len {
            return Err(ConfigError::InvalidOffsetPlusDataLen(
                offset + data.len() as u64,
            ));
        }
        let start = offset as usize;
        data.copy_from_slice(&state.config_space[start..start + data.len()]);
        Ok(())
    }

    /// Writes `data` into the config space at `offset`, then invokes the
    /// backend's config-write hook.
    pub fn write_config(&self, offset: u64, data: &[u8]) -> ConfigResult {
        let mut state = self.state.lock().unwrap();
        let len = state.config_space.len() as u64;
        if offset >= len {
            return Err(ConfigError::InvalidOffset(offset));
        }
        if offset + data.len() as u64 > len {
            return Err(ConfigError::InvalidOffsetPlusDataLen(
                offset + data.len() as u64,
            ));
        }
        let start = offset as usize;
        state.config_space[start..start + data.len()].copy_from_slice(data);
        self.backend
            .lock()
            .unwrap()
            .config_write(&mut state.config_space);
        Ok(())
    }

    fn device_features_window(&self, sel: u32) -> u32 {
        match sel {
            0 => self.device_features as u32,
            1 => (self.device_features >> 32) as u32,
            _ => 0,
        }
    }

    /// The FEATURES_OK transition: accept only if the driver requested no
    /// feature the device did not offer and VERSION_1 is among them;
    /// otherwise strip FEATURES_OK from the value so the driver observes the
    /// rejection on its next status read.
    fn update_status(&self, state: &mut MmioState, mut val: u32) {
        if state.status & DEVICE_FEATURES_OK == 0 && val & DEVICE_FEATURES_OK != 0 {
            let negotiated = state.driver_features & self.device_features;
            if negotiated == state.driver_features
                && negotiated & (1u64 << VIRTIO_F_VERSION_1) != 0
            {
                debug!(
                    "{}: negotiated features 0x{:x}",
                    self.name, negotiated
                );
                state.negotiated_features = negotiated;
            } else {
                warn!(
                    "{}: feature negotiation failed, offered 0x{:x}, requested 0x{:x}",
                    self.name, self.device_features, state.driver_features
                );
                val ^= DEVICE_FEATURES_OK;
            }
        }

        state.status = val;
        if val == 0 {
            self.reset(state);
        }
    }

    /// Full device reset: back to a freshly constructed device modulo
    /// identity fields.
    fn reset(&self, state: &mut MmioState) {
        self.irq.lower();
        self.interrupt_status.write(0);
        state.status = 0;
        state.queue_sel = 0;
        state.device_features_sel = 0;
        state.driver_features_sel = 0;
        state.driver_features = 0;
        state.negotiated_features = 0;
        for q in state.queues.iter_mut() {
            q.reset();
        }
    }

    fn make_chain(
        &self,
        rings: crate::queue::QueueRings,
        queue_idx: u16,
        head: u16,
        read_size: u32,
        write_size: u32,
    ) -> DescChain {
        DescChain::new(
            self.mem.clone(),
            rings,
            self.interrupt_status.clone(),
            self.irq.clone(),
            queue_idx,
            head,
            read_size,
            write_size,
        )
    }

    /// Drains queue `queue_idx`: refreshes the cached available index, then
    /// feeds every pending chain to the backend until the queue is empty or
    /// the backend asks for backpressure. Malformed chains are skipped
    /// without being published.
    pub fn drain_queue(&self, queue_idx: u16) -> Result<()> {
        let (rings, manual) = {
            let state = self.state.lock().unwrap();
            let q = &state.queues[queue_idx as usize % MAX_QUEUE];
            if !q.ready {
                return Ok(());
            }
            (q.rings(), q.manual_recv)
        };

        let avail_idx = rings.avail_idx(&*self.mem)?;
        self.state.lock().unwrap().queues[queue_idx as usize % MAX_QUEUE].cached_avail_idx =
            avail_idx;
        if manual {
            return Ok(());
        }
        fence(Ordering::Acquire);

        loop {
            let last = {
                let state = self.state.lock().unwrap();
                state.queues[queue_idx as usize % MAX_QUEUE].last_avail_idx
            };
            if last == avail_idx {
                break;
            }

            let head = rings.avail_entry(&*self.mem, last)?;
            match rings.chain_rw_size(&*self.mem, head) {
                Ok((read_size, write_size)) => {
                    let chain = self.make_chain(rings, queue_idx, head, read_size, write_size);
                    let outcome = self.backend.lock().unwrap().recv(chain);
                    match outcome {
                        Ok(RecvOutcome::Backpressure) => return Ok(()),
                        Ok(RecvOutcome::Done) => {}
                        Err(e) => {
                            debug!(
                                "{}: queue {} chain {} dropped: {}",
                                self.name, queue_idx, head, e
                            );
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        "{}: queue {} skipping malformed chain {}: {}",
                        self.name, queue_idx, head, e
                    );
                }
            }

            self.advance_avail(queue_idx);
        }

        Ok(())
    }

    /// Peeks the next chain of a manual-recv queue without consuming it.
    /// Uses the available index cached at the last notification.
    pub fn next_available(&self, queue_idx: u16) -> Result<Option<DescChain>> {
        let (rings, last) = {
            let state = self.state.lock().unwrap();
            let q = &state.queues[queue_idx as usize % MAX_QUEUE];
            if !q.ready || q.desc_addr == 0 || !q.has_available() {
                return Ok(None);
            }
            (q.rings(), q.last_avail_idx)
        };

        let head = rings.avail_entry(&*self.mem, last)?;
        let (read_size, write_size) = rings.chain_rw_size(&*self.mem, head)?;
        Ok(Some(self.make_chain(
            rings, queue_idx, head, read_size, write_size,
        )))
    }

    /// Consumes the chain last returned by [`next_available`].
    ///
    /// [`next_available`]: Self::next_available
    pub fn advance_avail(&self, queue_idx: u16) {
        let mut state = self.state.lock().unwrap();
        let q = &mut state.queues[queue_idx as usize % MAX_QUEUE];
        q.last_avail_idx = q.last_avail_idx.wrapping_add(1);
    }

    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) {
        if offset >= REG_MMIO_CONFIG {
            if self.read_config(offset - REG_MMIO_CONFIG, data).is_err() {
                for b in data.iter_mut() {
                    *b = 0;
                }
            }
            return;
        }

        if data.len() != 4 {
            info!(
                "{}: unhandled mmio read 0x{:x}/{}",
                self.name,
                offset,
                data.len()
            );
            for b in data.iter_mut() {
                *b = 0;
            }
            return;
        }

        let state = self.state.lock().unwrap();
        let v = match offset {
            REG_MMIO_MAGIC_VALUE => MMIO_MAGIC_VALUE,
            REG_MMIO_VERSION => MMIO_VERSION_2,
            REG_MMIO_DEVICE_ID => self.device_id,
            REG_MMIO_VENDOR_ID => self.vendor_id,
            REG_MMIO_DEVICE_FEATURE => self.device_features_window(state.device_features_sel),
            REG_MMIO_DEVICE_FEATURES_S => state.device_features_sel,
            REG_MMIO_QUEUE_SEL => state.queue_sel,
            REG_MMIO_QUEUE_NUM_MA => MAX_QUEUE_NUM as u32,
            REG_MMIO_QUEUE_NUM => state.selected_queue().size as u32,
            REG_MMIO_QUEUE_READY => state.selected_queue().ready as u32,
            REG_MMIO_QUEUE_DESC_LOW => state.selected_queue().desc_addr as u32,
            REG_MMIO_QUEUE_DESC_HIGH => (state.selected_queue().desc_addr >> 32) as u32,
            REG_MMIO_QUEUE_AVAIL_LOW => state.selected_queue().avail_addr as u32,
            REG_MMIO_QUEUE_AVAIL_HIGH => (state.selected_queue().avail_addr >> 32) as u32,
            REG_MMIO_QUEUE_USED_LOW => state.selected_queue().used_addr as u32,
            REG_MMIO_QUEUE_USED_HIGH => (state.selected_queue().used_addr >> 32) as u32,
            REG_MMIO_INTERRUPT_STAT => self.interrupt_status.read(),
            REG_MMIO_STATUS => state.status,
            REG_MMIO_CONFIG_GENERATI => 0,
            _ => 0,
        };
        LittleEndian::write_u32(data, v);
    }

    pub fn mmio_write(&self, offset: u64, data: &[u8]) {
        if offset >= REG_MMIO_CONFIG {
            if let Err(e) = self.write_config(offset - REG_MMIO_CONFIG, data) {
                debug!("{}: config write ignored: {}", self.name, e);
            }
            return;
        }

        if data.len() != 4 {
            info!(
                "{}: unhandled mmio write 0x{:x}/{}",
                self.name,
                offset,
                data.len()
            );
            return;
        }
        let val = LittleEndian::read_u32(data);

        let mut state = self.state.lock().unwrap();
        match offset {
            REG_MMIO_DEVICE_FEATURES_S => state.device_features_sel = val,
            REG_MMIO_DRIVER_FEATURES_S => state.driver_features_sel = val,
            REG_MMIO_DRIVER_FEATURE => {
                // OR, not assignment: the guest sets bits across the two
                // selector windows and cannot clear one without a reset.
                match state.driver_features_sel {
                    0 => state.driver_features |= val as u64,
                    1 => state.driver_features |= (val as u64) << 32,
                    _ => {}
                }
            }
            REG_MMIO_QUEUE_SEL => {
                if (val as usize) < MAX_QUEUE {
                    state.queue_sel = val;
                }
            }
            REG_MMIO_QUEUE_NUM => {
                if val.is_power_of_two() && val <= u16::MAX as u32 {
                    state.selected_queue_mut().size = val as u16;
                }
            }
            REG_MMIO_QUEUE_READY => state.selected_queue_mut().ready = val & 1 == 1,
            REG_MMIO_QUEUE_NOTIF => {
                if (val as usize) < MAX_QUEUE {
                    self.notify_queue(val as u16);
                }
            }
            REG_MMIO_INTERRUPT_AC => {
                if self.interrupt_status.clear_bits(val) == 0 {
                    self.irq.lower();
                }
            }
            REG_MMIO_STATUS => self.update_status(&mut state, val),
            REG_MMIO_QUEUE_DESC_LOW => set_low32(&mut state.selected_queue_mut().desc_addr, val),
            REG_MMIO_QUEUE_DESC_HIGH => set_high32(&mut state.selected_queue_mut().desc_addr, val),
            REG_MMIO_QUEUE_AVAIL_LOW => set_low32(&mut state.selected_queue_mut().avail_addr, val),
            REG_MMIO_QUEUE_AVAIL_HIGH => {
                set_high32(&mut state.selected_queue_mut().avail_addr, val)
            }
            REG_MMIO_QUEUE_USED_LOW => set_low32(&mut state.selected_queue_mut().used_addr, val),
            REG_MMIO_QUEUE_USED_HIGH => set_high32(&mut state.selected_queue_mut().used_addr, val),
            _ => info!("{}: unknown mmio write 0x{:x}", self.name, offset),
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_state(&self, queue_idx: u16) -> QueueState {
        self.state.lock().unwrap().queues[queue_idx as usize % MAX_QUEUE]
    }
}

impl MmioHandler for VirtioMmioDevice {
    fn read(&self, offset: u64, data: &mut [u8]) {
        self.mmio_read(offset, data)
    }

    fn write(&self, offset: u64, data: &[u8]) {
        self.mmio_write(offset, data)
    }
}

fn set_low32(addr: &mut u64, val: u32) {
    *addr = (*addr & !0xffff_ffff) | val as u64;
}

fn set_high32(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xffff_ffff) | ((val as u64) << 32);
}
