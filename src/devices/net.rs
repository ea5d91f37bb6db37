// SPDX-License-Identifier: Apache-2.0

//! Virtio network device.
//!
//! Queue 0 receives frames into guest buffers and is polled manually when
//! the backend reports a packet; queue 1 transmits guest frames to the
//! backend. Each frame is prefixed by the virtio net header, which stays
//! all-zero since no offload features are offered.

use std::io;
use std::mem::size_of;
use std::sync::Arc;

use log::{debug, warn};
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;
use virtio_bindings::bindings::virtio_net::{virtio_net_hdr_v1, VIRTIO_NET_F_MAC};

use crate::bus::VirtioBus;
use crate::device::{DeviceParams, RecvOutcome, VirtioBackend, VirtioMmioDevice};
use crate::queue::DescChain;
use crate::{Result, TYPE_NET};

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

/// Config-space offset of the link-status byte.
const CONFIG_STATUS_OFFSET: u64 = 6;

#[inline]
fn net_hdr_len() -> usize {
    size_of::<virtio_net_hdr_v1>()
}

/// Frame transport behind the network device, e.g. a TAP interface.
/// Incoming frames are pushed through [`NetDevice::deliver_packet`] by
/// whatever thread services the backend.
pub trait NetBackend: Send + 'static {
    fn mac_address(&self) -> [u8; 6];

    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

struct VirtioNet {
    backend: Box<dyn NetBackend>,
}

impl VirtioBackend for VirtioNet {
    fn recv(&mut self, chain: DescChain) -> Result<RecvOutcome> {
        if chain.queue_idx != TX_QUEUE {
            return Ok(RecvOutcome::Done);
        }
        let hdr_len = net_hdr_len();
        if (chain.read_size as usize) < hdr_len {
            debug!("virtio-net: runt tx chain of {} bytes", chain.read_size);
            chain.publish(0)?;
            return Ok(RecvOutcome::Done);
        }

        let len = chain.read_size as usize - hdr_len;
        let mut frame = vec![0u8; len];
        chain.read_from(hdr_len, &mut frame)?;
        if let Err(e) = self.backend.send(&frame) {
            warn!("virtio-net: tx backend error: {}", e);
        }
        chain.publish(0)?;
        Ok(RecvOutcome::Done)
    }
}

/// Handle to a registered network device.
pub struct NetDevice {
    dev: Arc<VirtioMmioDevice>,
}

impl NetDevice {
    pub fn create(bus: &mut VirtioBus, backend: Box<dyn NetBackend>) -> Result<NetDevice> {
        let mac = backend.mac_address();
        let mut config_space = vec![0u8; 8];
        config_space[0..6].copy_from_slice(&mac);

        let features = (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_NET_F_MAC);
        let params = DeviceParams::new("virtio-net", TYPE_NET, features, config_space)
            .with_manual_queues(&[RX_QUEUE]);

        let dev = bus.register(params, Box::new(VirtioNet { backend }))?;
        Ok(NetDevice { dev })
    }

    pub fn device(&self) -> &Arc<VirtioMmioDevice> {
        &self.dev
    }

    /// True when the guest has posted a receive buffer.
    pub fn can_deliver(&self) -> bool {
        matches!(self.dev.next_available(RX_QUEUE), Ok(Some(_)))
    }

    /// Copies `frame` into the next posted receive buffer behind a zeroed
    /// net header. Returns false when no buffer is available or the buffer
    /// is too small; the buffer is kept for the next frame in that case.
    pub fn deliver_packet(&self, frame: &[u8]) -> Result<bool> {
        let chain = match self.dev.next_available(RX_QUEUE)? {
            Some(chain) => chain,
            None => {
                debug!("virtio-net: no rx buffer, dropping {} byte frame", frame.len());
                return Ok(false);
            }
        };

        let hdr_len = net_hdr_len();
        let total = hdr_len + frame.len();
        if total > chain.write_size as usize {
            debug!(
                "virtio-net: frame of {} bytes exceeds rx buffer of {}",
                total, chain.write_size
            );
            return Ok(false);
        }

        chain.write_to(0, &vec![0u8; hdr_len])?;
        chain.write_to(hdr_len, frame)?;
        chain.publish(total as u32)?;
        self.dev.advance_avail(RX_QUEUE);
        Ok(true)
    }

    /// Reflects a link state change in the config space and raises the
    /// config-change interrupt if the state actually flipped.
    pub fn set_carrier(&self, up: bool) {
        let mut cur = [0u8];
        if self.dev.read_config(CONFIG_STATUS_OFFSET, &mut cur).is_err() {
            return;
        }
        let new = up as u8;
        if cur[0] & 1 != new {
            let _ = self.dev.write_config(CONFIG_STATUS_OFFSET, &[new]);
            self.dev.signal_config_change();
        }
    }
}
