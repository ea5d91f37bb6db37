// SPDX-License-Identifier: Apache-2.0

//! Virtio console device.
//!
//! Queue 0 carries host input into the guest and is polled manually by the
//! terminal pump; queue 1 carries guest output to the host sink. The config
//! space holds the terminal size, updated on resize events.

use std::io::Write;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;

use crate::bus::VirtioBus;
use crate::device::{DeviceParams, RecvOutcome, VirtioBackend, VirtioMmioDevice};
use crate::queue::DescChain;
use crate::{Result, TYPE_CONSOLE};

/// Device offers the console size through the config space.
const VIRTIO_CONSOLE_F_SIZE: u64 = 0;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

struct VirtioConsole {
    output: Box<dyn Write + Send>,
}

impl VirtioBackend for VirtioConsole {
    fn recv(&mut self, chain: DescChain) -> Result<RecvOutcome> {
        if chain.queue_idx != TX_QUEUE {
            return Ok(RecvOutcome::Done);
        }
        let mut buf = vec![0u8; chain.read_size as usize];
        chain.read_from(0, &mut buf)?;
        self.output.write_all(&buf)?;
        self.output.flush()?;
        chain.publish(0)?;
        Ok(RecvOutcome::Done)
    }
}

/// Handle to a registered console device.
pub struct ConsoleDevice {
    dev: Arc<VirtioMmioDevice>,
}

impl ConsoleDevice {
    /// Creates a console whose guest output goes to `output`.
    pub fn create(bus: &mut VirtioBus, output: Box<dyn Write + Send>) -> Result<ConsoleDevice> {
        let features = (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_CONSOLE_F_SIZE);
        let params = DeviceParams::new("virtio-console", TYPE_CONSOLE, features, vec![0u8; 4])
            .with_manual_queues(&[RX_QUEUE]);
        let dev = bus.register(params, Box::new(VirtioConsole { output }))?;
        Ok(ConsoleDevice { dev })
    }

    pub fn device(&self) -> &Arc<VirtioMmioDevice> {
        &self.dev
    }

    /// True when the guest has posted an input buffer.
    pub fn can_write_input(&self) -> bool {
        matches!(self.dev.next_available(RX_QUEUE), Ok(Some(_)))
    }

    /// Capacity of the next posted input buffer; callers clamp their read
    /// to this before pushing data in.
    pub fn input_len(&self) -> usize {
        match self.dev.next_available(RX_QUEUE) {
            Ok(Some(chain)) => chain.write_size as usize,
            _ => 0,
        }
    }

    /// Pushes host input into the guest's next posted buffer. Returns the
    /// number of bytes handed over; 0 when no buffer is available.
    pub fn write_input(&self, buf: &[u8]) -> Result<usize> {
        let chain = match self.dev.next_available(RX_QUEUE)? {
            Some(chain) => chain,
            None => return Ok(0),
        };
        if let Err(e) = chain.write_to(0, buf) {
            debug!("virtio-console: input truncated: {}", e);
        }
        chain.publish(buf.len() as u32)?;
        self.dev.advance_avail(RX_QUEUE);
        Ok(buf.len())
    }

    /// Publishes a new terminal size and raises the config-change interrupt.
    pub fn resize(&self, width: u16, height: u16) {
        self.dev.update_config(|config| {
            LittleEndian::write_u16(&mut config[0..2], width);
            LittleEndian::write_u16(&mut config[2..4], height);
        });
    }
}
