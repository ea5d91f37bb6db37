// SPDX-License-Identifier: Apache-2.0

//! Virtio input device: keyboard, mouse and tablet variants.
//!
//! Queue 0 carries events into the guest and is filled by the host event
//! sources; queue 1 carries status updates (LEDs) back and is simply
//! consumed. The variants differ only in how the config-write hook answers
//! the driver's configuration subcommands.

use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;

use crate::bus::VirtioBus;
use crate::device::{DeviceParams, RecvOutcome, VirtioBackend, VirtioMmioDevice};
use crate::queue::DescChain;
use crate::{Result, TYPE_INPUT};

const EVENT_QUEUE: u16 = 0;
const STATUS_QUEUE: u16 = 1;

// Config subcommands written by the driver at config byte 0.
const VIRTIO_INPUT_CFG_UNSET: u8 = 0x00;
const VIRTIO_INPUT_CFG_ID_NAME: u8 = 0x01;
const VIRTIO_INPUT_CFG_EV_BITS: u8 = 0x11;
const VIRTIO_INPUT_CFG_ABS_INFO: u8 = 0x12;

// Linux event types.
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const EV_ABS: u16 = 0x03;
const EV_REP: u8 = 0x14;

const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;

const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;

const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;

/// Absolute axes report positions in `0..ABS_SCALE`.
pub const ABS_SCALE: u32 = 32768;

const BUTTONS: [u16; 3] = [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputKind {
    Keyboard,
    Mouse,
    Tablet,
}

impl InputKind {
    fn device_name(&self) -> &'static str {
        match self {
            InputKind::Keyboard => "virtio_keyboard",
            InputKind::Mouse => "virtio_mouse",
            InputKind::Tablet => "virtio_tablet",
        }
    }
}

fn set_bit(tab: &mut [u8], k: u16) {
    tab[(k >> 3) as usize] |= 1 << (k & 7);
}

struct VirtioInput {
    kind: InputKind,
}

impl VirtioInput {
    /// Answers the configuration subcommand the driver selected by writing
    /// config bytes 0 (select) and 1 (subselect): the reply size lands in
    /// byte 2 and the payload at bytes 8 and up.
    fn answer_config(&self, config: &mut [u8]) {
        let select = config[0];
        let subsel = config[1];
        match select {
            VIRTIO_INPUT_CFG_UNSET => {}
            VIRTIO_INPUT_CFG_ID_NAME => {
                let name = self.kind.device_name().as_bytes();
                config[2] = name.len() as u8;
                config[8..8 + name.len()].copy_from_slice(name);
            }
            VIRTIO_INPUT_CFG_EV_BITS => {
                config[2] = 0;
                match (self.kind, subsel as u16) {
                    (InputKind::Keyboard, EV_KEY) => {
                        config[2] = 128 / 8;
                        for b in config[8..8 + 128 / 8].iter_mut() {
                            *b = 0xff;
                        }
                    }
                    (InputKind::Keyboard, _) if subsel == EV_REP => {
                        // Key repetition is allowed; the reply carries no
                        // payload bits.
                        config[2] = 1;
                    }
                    (InputKind::Mouse, EV_KEY) | (InputKind::Tablet, EV_KEY) => {
                        config[2] = (512u16 / 8) as u8;
                        for b in config[8..8 + 512 / 8].iter_mut() {
                            *b = 0;
                        }
                        for btn in BUTTONS.iter() {
                            set_bit(&mut config[8..], *btn);
                        }
                    }
                    (InputKind::Mouse, EV_REL) => {
                        config[2] = 2;
                        config[8] = 0;
                        config[9] = 0;
                        set_bit(&mut config[8..], REL_X);
                        set_bit(&mut config[8..], REL_Y);
                        set_bit(&mut config[8..], REL_WHEEL);
                    }
                    (InputKind::Tablet, EV_REL) => {
                        config[2] = 2;
                        config[8] = 0;
                        config[9] = 0;
                        set_bit(&mut config[8..], REL_WHEEL);
                    }
                    (InputKind::Tablet, EV_ABS) => {
                        config[2] = 1;
                        config[8] = 0;
                        set_bit(&mut config[8..], ABS_X);
                        set_bit(&mut config[8..], ABS_Y);
                    }
                    _ => {}
                }
            }
            VIRTIO_INPUT_CFG_ABS_INFO => {
                if self.kind == InputKind::Tablet && subsel <= 1 {
                    // min/max/fuzz/flat/res for ABS_X and ABS_Y.
                    config[2] = 5 * 4;
                    LittleEndian::write_u32(&mut config[8..12], 0);
                    LittleEndian::write_u32(&mut config[12..16], ABS_SCALE - 1);
                    LittleEndian::write_u32(&mut config[16..20], 0);
                    LittleEndian::write_u32(&mut config[20..24], 0);
                    LittleEndian::write_u32(&mut config[24..28], 0);
                }
            }
            _ => config[2] = 0,
        }
    }
}

impl VirtioBackend for VirtioInput {
    fn recv(&mut self, chain: DescChain) -> Result<RecvOutcome> {
        if chain.queue_idx == STATUS_QUEUE {
            // LED and keyboard state updates; consumed without effect.
            chain.publish(0)?;
        }
        Ok(RecvOutcome::Done)
    }

    fn config_write(&mut self, config: &mut [u8]) {
        self.answer_config(config);
    }
}

/// Handle to a registered input device.
pub struct InputDevice {
    dev: Arc<VirtioMmioDevice>,
    kind: InputKind,
    buttons_state: Mutex<u32>,
}

impl InputDevice {
    pub fn create(bus: &mut VirtioBus, kind: InputKind) -> Result<InputDevice> {
        let features = 1u64 << VIRTIO_F_VERSION_1;
        let params = DeviceParams::new("virtio-input", TYPE_INPUT, features, vec![0u8; 256])
            .with_manual_queues(&[EVENT_QUEUE]);
        let dev = bus.register(params, Box::new(VirtioInput { kind }))?;
        Ok(InputDevice {
            dev,
            kind,
            buttons_state: Mutex::new(0),
        })
    }

    pub fn device(&self) -> &Arc<VirtioMmioDevice> {
        &self.dev
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Queues one 8-byte input event. Returns false when the guest has no
    /// event buffer posted.
    fn queue_event(&self, ev_type: u16, code: u16, value: u32) -> Result<bool> {
        let chain = match self.dev.next_available(EVENT_QUEUE)? {
            Some(chain) => chain,
            None => return Ok(false),
        };
        let mut buf = [0u8; 8];
        LittleEndian::write_u16(&mut buf[0..2], ev_type);
        LittleEndian::write_u16(&mut buf[2..4], code);
        LittleEndian::write_u32(&mut buf[4..8], value);
        chain.write_to(0, &buf)?;
        chain.publish(8)?;
        self.dev.advance_avail(EVENT_QUEUE);
        Ok(true)
    }

    /// Sends a key press or release followed by a SYN frame. Only valid on
    /// the keyboard variant.
    pub fn send_key_event(&self, is_down: bool, key_code: u16) -> Result<bool> {
        if self.kind != InputKind::Keyboard {
            return Ok(false);
        }
        if !self.queue_event(EV_KEY, key_code, is_down as u32)? {
            return Ok(false);
        }
        self.queue_event(EV_SYN, 0, 0)
    }

    /// Sends a motion/button update followed by a SYN frame. Valid on the
    /// mouse (relative) and tablet (absolute) variants.
    pub fn send_mouse_event(&self, dx: i32, dy: i32, dz: i32, buttons: u32) -> Result<bool> {
        match self.kind {
            InputKind::Mouse => {
                if !self.queue_event(EV_REL, REL_X, dx as u32)? {
                    return Ok(false);
                }
                if !self.queue_event(EV_REL, REL_Y, dy as u32)? {
                    return Ok(false);
                }
            }
            InputKind::Tablet => {
                if !self.queue_event(EV_ABS, ABS_X, dx as u32)? {
                    return Ok(false);
                }
                if !self.queue_event(EV_ABS, ABS_Y, dy as u32)? {
                    return Ok(false);
                }
            }
            InputKind::Keyboard => return Ok(false),
        }
        if dz != 0 && !self.queue_event(EV_REL, REL_WHEEL, dz as u32)? {
            return Ok(false);
        }

        let mut state = self.buttons_state.lock().unwrap();
        if buttons != *state {
            for (i, btn) in BUTTONS.iter().enumerate() {
                let now = (buttons >> i) & 1;
                let before = (*state >> i) & 1;
                if now != before && !self.queue_event(EV_KEY, *btn, now)? {
                    return Ok(false);
                }
            }
            *state = buttons;
        }

        self.queue_event(EV_SYN, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::IrqVector;
    use crate::memory::GuestMemory;
    use crate::queue::VIRTQ_DESC_F_WRITE;
    use crate::tests::*;

    const VERSION_1: u64 = 1u64 << VIRTIO_F_VERSION_1;

    fn input_setup(kind: InputKind) -> (InputDevice, Arc<crate::tests::TestMemory>, GuestQueue) {
        let mem = test_mem(0x100000);
        let mut bus = VirtioBus::new(mem.clone() as Arc<dyn GuestMemory>, Arc::new(IrqVector::new()));
        let input = InputDevice::create(&mut bus, kind).unwrap();
        negotiate(input.device(), VERSION_1);
        let gq = GuestQueue::new(0x1000, 16);
        setup_queue(input.device(), EVENT_QUEUE as u32, &gq);
        (input, mem, gq)
    }

    fn post_event_buffers(
        input: &InputDevice,
        mem: &dyn GuestMemory,
        gq: &mut GuestQueue,
        count: u16,
    ) {
        for i in 0..count {
            gq.write_desc(mem, i, 0x20000 + 8 * i as u64, 8, VIRTQ_DESC_F_WRITE, 0);
            gq.push_avail(mem, i);
        }
        input.device().drain_queue(EVENT_QUEUE).unwrap();
    }

    fn config_query(input: &InputDevice, select: u8, subsel: u8) -> Vec<u8> {
        input.device().write_config(0, &[select, subsel]).unwrap();
        let mut config = vec![0u8; 256];
        input.device().read_config(0, &mut config).unwrap();
        config
    }

    #[test]
    fn test_id_name_query() {
        let (input, _, _) = input_setup(InputKind::Keyboard);
        let config = config_query(&input, VIRTIO_INPUT_CFG_ID_NAME, 0);
        assert_eq!(config[2] as usize, "virtio_keyboard".len());
        assert_eq!(&config[8..8 + 15], b"virtio_keyboard");
    }

    #[test]
    fn test_keyboard_ev_bits() {
        let (input, _, _) = input_setup(InputKind::Keyboard);
        let config = config_query(&input, VIRTIO_INPUT_CFG_EV_BITS, EV_KEY as u8);
        assert_eq!(config[2], 16);
        assert!(config[8..24].iter().all(|&b| b == 0xff));

        let config = config_query(&input, VIRTIO_INPUT_CFG_EV_BITS, EV_REP);
        assert_eq!(config[2], 1);

        let config = config_query(&input, VIRTIO_INPUT_CFG_EV_BITS, EV_ABS as u8);
        assert_eq!(config[2], 0);
    }

    #[test]
    fn test_mouse_ev_bits() {
        let (input, _, _) = input_setup(InputKind::Mouse);
        let config = config_query(&input, VIRTIO_INPUT_CFG_EV_BITS, EV_REL as u8);
        assert_eq!(config[2], 2);
        assert_eq!(config[8], 0b11);
        assert_eq!(config[9], 0b1);

        let config = config_query(&input, VIRTIO_INPUT_CFG_EV_BITS, EV_KEY as u8);
        assert_eq!(config[2], 64);
        // BTN_LEFT..BTN_MIDDLE live at bits 0x110..0x112.
        assert_eq!(config[8 + 0x110 / 8], 0b111);
    }

    #[test]
    fn test_tablet_abs_info() {
        let (input, _, _) = input_setup(InputKind::Tablet);
        // Axes above Y get no reply.
        let config = config_query(&input, VIRTIO_INPUT_CFG_ABS_INFO, 2);
        assert_eq!(config[2], 0);

        let config = config_query(&input, VIRTIO_INPUT_CFG_ABS_INFO, 1);
        assert_eq!(config[2], 20);
        assert_eq!(LittleEndian::read_u32(&config[8..12]), 0);
        assert_eq!(LittleEndian::read_u32(&config[12..16]), ABS_SCALE - 1);
    }

    #[test]
    fn test_key_event_emits_syn_frame() {
        let (input, mem, mut gq) = input_setup(InputKind::Keyboard);
        post_event_buffers(&input, &*mem, &mut gq, 4);

        assert!(input.send_key_event(true, 30).unwrap());
        assert_eq!(gq.used_idx(&*mem), 2);

        let mut ev = [0u8; 8];
        mem.dma_read(0x20000, &mut ev).unwrap();
        assert_eq!(LittleEndian::read_u16(&ev[0..2]), EV_KEY);
        assert_eq!(LittleEndian::read_u16(&ev[2..4]), 30);
        assert_eq!(LittleEndian::read_u32(&ev[4..8]), 1);

        mem.dma_read(0x20008, &mut ev).unwrap();
        assert_eq!(LittleEndian::read_u16(&ev[0..2]), EV_SYN);
    }

    #[test]
    fn test_key_event_without_buffers_fails() {
        let (input, _, _) = input_setup(InputKind::Keyboard);
        assert!(!input.send_key_event(true, 30).unwrap());
    }

    #[test]
    fn test_mouse_buttons_report_transitions_only() {
        let (input, mem, mut gq) = input_setup(InputKind::Mouse);
        post_event_buffers(&input, &*mem, &mut gq, 16);

        // Motion plus left button down: REL_X, REL_Y, BTN_LEFT, SYN.
        assert!(input.send_mouse_event(3, -1, 0, 1).unwrap());
        assert_eq!(gq.used_idx(&*mem), 4);

        let mut ev = [0u8; 8];
        mem.dma_read(0x20000 + 2 * 8, &mut ev).unwrap();
        assert_eq!(LittleEndian::read_u16(&ev[0..2]), EV_KEY);
        assert_eq!(LittleEndian::read_u16(&ev[2..4]), BTN_LEFT);
        assert_eq!(LittleEndian::read_u32(&ev[4..8]), 1);

        // Same button state again: only motion and SYN.
        assert!(input.send_mouse_event(1, 1, 0, 1).unwrap());
        assert_eq!(gq.used_idx(&*mem), 7);
    }

    #[test]
    fn test_wrong_variant_rejected() {
        let (input, mem, mut gq) = input_setup(InputKind::Mouse);
        post_event_buffers(&input, &*mem, &mut gq, 4);
        assert!(!input.send_key_event(true, 30).unwrap());
        assert_eq!(gq.used_idx(&*mem), 0);
    }
}
