// SPDX-License-Identifier: Apache-2.0

//! Registry wiring emulated peripherals to the platform.
//!
//! The bus hands out consecutive 4 KiB MMIO windows and IRQ lines to devices
//! as they are created, collects the address ranges the router dispatches
//! on, and owns the shared notification worker.

use std::mem;
use std::sync::Arc;

use log::debug;

use crate::device::{DeviceParams, VirtioBackend, VirtioMmioDevice, MMIO_PAGE_SIZE};
use crate::irq::{IrqController, IrqLine};
use crate::memory::GuestMemory;
use crate::notifier::{NotifyWorker, QueueNotifier};
use crate::router::{AddressMap, MmioHandler};
use crate::Result;

/// Guest physical address of the first virtio MMIO window.
pub const VIRTIO_MMIO_BASE: u64 = 0x4000_0000;
/// Platform IRQ line of the first virtio device; subsequent devices take
/// consecutive lines.
pub const FIRST_VIRTIO_IRQ: u32 = 3;

/// Creates virtio devices against the platform and runs their shared
/// notification worker.
pub struct VirtioBus {
    mem: Arc<dyn GuestMemory>,
    irq_controller: Arc<dyn IrqController>,
    notifier: QueueNotifier,
    map: AddressMap,
    devices: Vec<Arc<VirtioMmioDevice>>,
    next_base: u64,
    next_irq: u32,
    worker: Option<NotifyWorker>,
}

impl VirtioBus {
    pub fn new(mem: Arc<dyn GuestMemory>, irq_controller: Arc<dyn IrqController>) -> Self {
        VirtioBus {
            mem,
            irq_controller,
            notifier: QueueNotifier::new(),
            map: AddressMap::new(),
            devices: Vec::new(),
            next_base: VIRTIO_MMIO_BASE,
            next_irq: FIRST_VIRTIO_IRQ,
            worker: None,
        }
    }

    pub fn guest_memory(&self) -> Arc<dyn GuestMemory> {
        self.mem.clone()
    }

    pub fn notifier(&self) -> QueueNotifier {
        self.notifier.clone()
    }

    pub fn devices(&self) -> &[Arc<VirtioMmioDevice>] {
        &self.devices
    }

    /// Creates a device on the next free MMIO window and IRQ line. Called by
    /// the device-class constructors in [`crate::devices`].
    pub fn register(
        &mut self,
        params: DeviceParams,
        backend: Box<dyn VirtioBackend>,
    ) -> Result<Arc<VirtioMmioDevice>> {
        let base = self.next_base;
        let irq = IrqLine::new(self.irq_controller.clone(), self.next_irq);
        let dev = VirtioMmioDevice::new(
            params,
            backend,
            self.mem.clone(),
            irq,
            self.notifier.clone(),
        )?;
        self.map
            .add(base, MMIO_PAGE_SIZE, dev.clone() as Arc<dyn MmioHandler>)?;
        debug!(
            "{}: registered at 0x{:08x} irq {}",
            dev.name(),
            base,
            self.next_irq
        );
        self.next_base += MMIO_PAGE_SIZE;
        self.next_irq += 1;
        self.devices.push(dev.clone());
        Ok(dev)
    }

    /// Hands the collected device ranges to the transaction router. Call
    /// after every device has been registered.
    pub fn take_address_map(&mut self) -> AddressMap {
        mem::take(&mut self.map)
    }

    /// Spawns the notification worker over the registered devices.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_none() {
            self.worker = Some(NotifyWorker::start(
                self.notifier.clone(),
                self.devices.clone(),
            )?);
        }
        Ok(())
    }

    /// Requests worker shutdown without waiting.
    pub fn stop(&self) {
        if let Some(worker) = &self.worker {
            worker.stop();
        }
    }

    /// Stops and joins the notification worker.
    pub fn join(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            worker.join();
        }
    }

    /// Resets every device, as the guest would by writing 0 to each status
    /// register.
    pub fn reset_all(&self) {
        for dev in self.devices.iter() {
            dev.mmio_write(crate::device::REG_MMIO_STATUS, &0u32.to_le_bytes());
        }
    }
}
