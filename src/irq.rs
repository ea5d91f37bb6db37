// SPDX-License-Identifier: Apache-2.0

//! Level-triggered interrupt plumbing between emulated devices and the
//! platform interrupt registers.
//!
//! The platform exposes a W1S/W1C register pair maintaining a global 32-bit
//! level vector; the guest IRQ controller sees the OR of all raised lines.
//! VirtIO devices are assigned consecutive line numbers starting at
//! [`FIRST_VIRTIO_IRQ`](crate::bus::FIRST_VIRTIO_IRQ).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Writer side of the platform interrupt level vector.
///
/// Offset 0 of the collaborator register pair is "set bits" (W1S), offset 4
/// is "clear bits" (W1C). Implementations also keep the resulting vector so
/// it can be read back.
pub trait IrqController: Send + Sync {
    /// Raises every line whose bit is set in `w1s`.
    fn set_levels(&self, w1s: u32);

    /// Lowers every line whose bit is set in `w1c`.
    fn clear_levels(&self, w1c: u32);

    /// Current level vector.
    fn levels(&self) -> u32;
}

/// In-memory level vector, usable standalone or as the cache behind a
/// register-backed controller.
#[derive(Default)]
pub struct IrqVector {
    levels: AtomicU32,
}

impl IrqVector {
    pub fn new() -> Self {
        IrqVector {
            levels: AtomicU32::new(0),
        }
    }
}

impl IrqController for IrqVector {
    fn set_levels(&self, w1s: u32) {
        self.levels.fetch_or(w1s, Ordering::SeqCst);
    }

    fn clear_levels(&self, w1c: u32) {
        self.levels.fetch_and(!w1c, Ordering::SeqCst);
    }

    fn levels(&self) -> u32 {
        self.levels.load(Ordering::SeqCst)
    }
}

/// One device's level-triggered interrupt line.
///
/// `raise` is idempotent; the line stays up until every pending interrupt
/// status bit has been acknowledged.
#[derive(Clone)]
pub struct IrqLine {
    controller: Arc<dyn IrqController>,
    irq_num: u32,
}

impl IrqLine {
    pub fn new(controller: Arc<dyn IrqController>, irq_num: u32) -> Self {
        IrqLine {
            controller,
            irq_num,
        }
    }

    pub fn irq_num(&self) -> u32 {
        self.irq_num
    }

    pub fn raise(&self) {
        self.controller.set_levels(1 << self.irq_num);
    }

    pub fn lower(&self) {
        self.controller.clear_levels(1 << self.irq_num);
    }
}

/// Struct to maintain the interrupt status of a virtio device.
pub struct InterruptStatusRegister32 {
    status: AtomicU32,
}

impl InterruptStatusRegister32 {
    /// Creates a status register with value 0.
    pub fn new() -> Self {
        InterruptStatusRegister32 {
            status: AtomicU32::new(0),
        }
    }

    /// Reads the current value.
    pub fn read(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    /// Writes a new value.
    pub fn write(&self, value: u32) {
        self.status.store(value, Ordering::SeqCst);
    }

    /// Sets the bits in `value` and returns the previous value.
    pub fn set_bits(&self, value: u32) -> u32 {
        self.status.fetch_or(value, Ordering::SeqCst)
    }

    /// Clears the bits in `value` and returns the resulting value.
    pub fn clear_bits(&self, value: u32) -> u32 {
        self.status.fetch_and(!value, Ordering::SeqCst) & !value
    }
}

impl Default for InterruptStatusRegister32 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_line_levels() {
        let ctrl: Arc<dyn IrqController> = Arc::new(IrqVector::new());
        let line3 = IrqLine::new(ctrl.clone(), 3);
        let line5 = IrqLine::new(ctrl.clone(), 5);

        line3.raise();
        line3.raise();
        assert_eq!(ctrl.levels(), 1 << 3);

        line5.raise();
        assert_eq!(ctrl.levels(), (1 << 3) | (1 << 5));

        line3.lower();
        assert_eq!(ctrl.levels(), 1 << 5);
        line5.lower();
        assert_eq!(ctrl.levels(), 0);
    }

    #[test]
    fn test_interrupt_status_register() {
        let status = InterruptStatusRegister32::new();
        assert_eq!(status.read(), 0);

        status.set_bits(0b101);
        assert_eq!(status.read(), 0b101);
        assert_eq!(status.clear_bits(0b100), 0b001);
        assert_eq!(status.read(), 0b001);
        status.write(0);
        assert_eq!(status.read(), 0);
    }
}
