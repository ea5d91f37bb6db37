// SPDX-License-Identifier: Apache-2.0

//! Emulated peripheral classes plugged into the virtio MMIO transport.

pub mod block;
pub mod console;
pub mod entropy;
pub mod input;
pub mod net;
pub mod p9;

pub use self::block::BlockDevice;
pub use self::console::ConsoleDevice;
pub use self::entropy::EntropyDevice;
pub use self::input::InputDevice;
pub use self::net::NetDevice;
pub use self::p9::P9Device;
