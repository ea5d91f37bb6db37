// SPDX-License-Identifier: Apache-2.0

//! Transaction router servicing intercepted guest MMIO.
//!
//! One request at a time is pulled from the MMIO-capture collaborator and
//! dispatched to the owning endpoint: a registered device range, the HTIF
//! tohost/fromhost words, the SiFive test finisher, the boot ROM, or the
//! stray-I/O sink. The router runs strictly serially and never blocks on
//! device work; queue notifications only toggle an atomic bit and signal the
//! notification worker.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

use crate::{Error, Result};

/// Reason the bridge stopped servicing the guest.
///
/// The SiFive test finisher only has 16 bits of exit code, so the reset
/// request is carried out-of-band instead of as a reserved code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopCode {
    /// Terminate with the given exit code.
    Exit(u32),
    /// The guest asked for a system reset.
    Reset,
}

/// Latch observed by the router loop. Device paths never call `exit()`;
/// they record the code here and the in-flight transaction still completes.
#[derive(Default)]
pub struct StopLatch {
    code: Mutex<Option<StopCode>>,
}

impl StopLatch {
    pub fn new() -> Self {
        StopLatch::default()
    }

    /// Records a stop request. The first request wins.
    pub fn request(&self, code: StopCode) {
        let mut slot = self.code.lock().unwrap();
        if slot.is_none() {
            *slot = Some(code);
        }
    }

    pub fn get(&self) -> Option<StopCode> {
        *self.code.lock().unwrap()
    }
}

/// Thread-safe byte queue feeding the HTIF fromhost character path.
/// Terminal code enqueues; the router dequeues one byte per fromhost read.
#[derive(Default)]
pub struct HtifInput {
    queue: Mutex<VecDeque<u8>>,
}

impl HtifInput {
    pub fn new() -> Self {
        HtifInput::default()
    }

    pub fn enqueue(&self, bytes: &[u8]) {
        let mut queue = self.queue.lock().unwrap();
        queue.extend(bytes.iter().copied());
    }

    pub fn dequeue(&self) -> Option<u8> {
        self.queue.lock().unwrap().pop_front()
    }
}

/// MMIO register handler bound to an address range.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

/// Half-open interval `[base, base + size)` of guest physical address space.
///
/// Ranges are installed at device construction and never removed; the
/// `enabled` bit exists for transports that relocate windows at runtime and
/// stays set for MMIO devices.
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
    pub enabled: bool,
    handler: Arc<dyn MmioHandler>,
}

impl AddressRange {
    fn contains(&self, addr: u64) -> bool {
        self.enabled && addr >= self.base && addr < self.base + self.size
    }
}

/// Ordered, non-overlapping set of device address ranges.
#[derive(Default)]
pub struct AddressMap {
    ranges: Vec<AddressRange>,
}

impl AddressMap {
    pub fn new() -> Self {
        AddressMap::default()
    }

    pub fn add(&mut self, base: u64, size: u64, handler: Arc<dyn MmioHandler>) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidInput);
        }
        for range in self.ranges.iter() {
            if base < range.base + range.size && range.base < base + size {
                return Err(Error::RangeOverlap(base));
            }
        }
        self.ranges.push(AddressRange {
            base,
            size,
            enabled: true,
            handler,
        });
        self.ranges.sort_by_key(|r| r.base);
        Ok(())
    }

    pub fn find(&self, addr: u64) -> Option<&AddressRange> {
        self.ranges.iter().find(|r| r.contains(addr))
    }
}

/// Read-only boot ROM window holding 64-bit words.
pub struct BootRom {
    pub base: u64,
    pub data: Vec<u64>,
}

impl BootRom {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + 8 * self.data.len() as u64
    }

    fn word_at(&self, addr: u64) -> u64 {
        self.data[((addr - self.base) / 8) as usize]
    }
}

/// One intercepted guest transaction, as presented by the capture device.
#[derive(Clone, Copy, Debug)]
pub struct MmioRequest {
    pub is_write: bool,
    pub addr: u64,
    pub wdata: u64,
    pub wstrobe: u8,
    pub read_len: u16,
    pub req_id: u16,
}

/// The MMIO-capture collaborator. The concrete ioctl/mmap protocol of the
/// kernel character device lives outside this crate.
pub trait InterceptPort: Send {
    /// Waits for the next intercepted transaction. Implementations should
    /// time out periodically and return `None` so the router can observe the
    /// stop latch.
    fn poll_request(&mut self) -> Result<Option<MmioRequest>>;

    /// Loads the response register for a read transaction.
    fn put_read_data(&mut self, data: u64) -> Result<()>;

    /// Completes the transaction towards the guest.
    fn send_response(&mut self) -> Result<()>;
}

/// Fixed platform addresses the router decodes besides device ranges.
#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    pub tohost_addr: u64,
    pub fromhost_addr: u64,
    pub sifive_test_addr: u64,
    pub htif_enabled: bool,
}

impl RouterConfig {
    /// tohost/fromhost derived from an HTIF base address, 8 bytes apart.
    pub fn with_htif_base(base: u64) -> Self {
        RouterConfig {
            tohost_addr: base,
            fromhost_addr: base + 8,
            sifive_test_addr: 0x5000_0000,
            htif_enabled: false,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig::with_htif_base(0x1000_1000)
    }
}

// Known-benign poll addresses that would otherwise flood the stray-read log.
const QUIET_STRAY_READS: [u64; 4] = [0x1000_1000, 0x1000_1008, 0x5000_1000, 0x5000_1008];

/// Services intercepted transactions one at a time.
pub struct TransactionRouter<P: InterceptPort> {
    port: P,
    map: AddressMap,
    config: RouterConfig,
    rom: Option<BootRom>,
    input: Arc<HtifInput>,
    stop: Arc<StopLatch>,
    console_out: Box<dyn Write + Send>,
}

impl<P: InterceptPort> TransactionRouter<P> {
    pub fn new(
        port: P,
        map: AddressMap,
        config: RouterConfig,
        rom: Option<BootRom>,
        input: Arc<HtifInput>,
        stop: Arc<StopLatch>,
    ) -> Self {
        TransactionRouter {
            port,
            map,
            config,
            rom,
            input,
            stop,
            console_out: Box::new(std::io::stdout()),
        }
    }

    /// Redirects HTIF console output, e.g. into a capture buffer.
    pub fn set_console_output(&mut self, out: Box<dyn Write + Send>) {
        self.console_out = out;
    }

    pub fn stop_latch(&self) -> Arc<StopLatch> {
        self.stop.clone()
    }

    /// Poll/dispatch/respond until a stop code is latched. The response for
    /// the transaction that triggered the stop still completes before the
    /// loop exits.
    pub fn run(&mut self) -> Result<StopCode> {
        loop {
            if let Some(code) = self.stop.get() {
                return Ok(code);
            }
            if let Some(req) = self.port.poll_request()? {
                self.handle_request(&req)?;
                self.port.send_response()?;
            }
        }
    }

    fn handle_request(&mut self, req: &MmioRequest) -> Result<()> {
        if req.is_write {
            self.handle_write(req)
        } else {
            self.handle_read(req)
        }
    }

    fn handle_write(&mut self, req: &MmioRequest) -> Result<()> {
        let addr = req.addr;
        if let Some(range) = self.map.find(addr) {
            let mut wdata = req.wdata;
            // Bit 2 selects the upper 32-bit lane of the 64-bit bus word.
            if addr & 4 != 0 {
                wdata >>= 32;
            }
            let offset = addr - range.base;
            debug!(
                "virtio write addr 0x{:08x} offset 0x{:x} data 0x{:08x} strobe 0x{:x}",
                addr, offset, wdata as u32, req.wstrobe
            );
            range.handler.write(offset, &(wdata as u32).to_le_bytes());
        } else if addr == self.config.tohost_addr {
            self.handle_tohost(req.wdata)?;
        } else if addr == self.config.fromhost_addr {
            // Guest clearing fromhost; nothing for us to do.
        } else if addr == self.config.sifive_test_addr {
            self.handle_test_finisher(req.wdata);
        } else {
            debug!(
                "stray io write addr 0x{:08x} data 0x{:x} strobe 0x{:x}",
                addr, req.wdata, req.wstrobe
            );
        }
        Ok(())
    }

    /// HTIF framing: `{dev:8, cmd:8, payload:48}`.
    fn handle_tohost(&mut self, wdata: u64) -> Result<()> {
        let dev = (wdata >> 56) & 0xff;
        let cmd = (wdata >> 48) & 0xff;
        let payload = wdata & 0x0000_ffff_ffff_ffff;
        if dev == 1 && cmd == 1 {
            self.console_out.write_all(&[payload as u8])?;
            self.console_out.flush()?;
        } else if dev == 0 && cmd == 0 {
            if payload == 1 {
                info!("PASS");
                self.stop.request(StopCode::Exit(0));
            } else {
                let code = (payload >> 1) as u32;
                info!("FAIL: error {}", code);
                self.stop.request(StopCode::Exit(code));
            }
        } else {
            warn!(
                "htif: dev={} cmd=0x{:02x} payload=0x{:x}",
                dev, cmd, payload
            );
        }
        Ok(())
    }

    /// SiFive test finisher: low 16 bits select pass/fail/reset, the high
    /// 16 bits carry the failure exit code.
    fn handle_test_finisher(&mut self, wdata: u64) {
        let status = wdata & 0xffff;
        match status {
            0x3333 => {
                let code = ((wdata >> 16) & 0xffff) as u32;
                info!("FAIL: error {}", code);
                self.stop.request(StopCode::Exit(code));
            }
            0x5555 => {
                info!("PASS");
                self.stop.request(StopCode::Exit(0));
            }
            0x7777 => self.stop.request(StopCode::Reset),
            _ => warn!("test finisher: status=0x{:04x}", status),
        }
    }

    fn handle_read(&mut self, req: &MmioRequest) -> Result<()> {
        let addr = req.addr;
        if req.read_len != 0 {
            error!("burst read addr 0x{:08x} len {}", addr, req.read_len);
            return Ok(());
        }

        let val = if let Some(range) = self.map.find(addr) {
            let offset = addr - range.base;
            let mut data = [0u8; 4];
            range.handler.read(offset, &mut data);
            let mut val = u32::from_le_bytes(data) as u64;
            // The 64-bit bus returns the value in the lane the address
            // selects.
            if offset % 8 == 4 {
                val <<= 32;
            }
            debug!(
                "virtio read addr 0x{:08x} offset 0x{:x} val 0x{:x}",
                addr, offset, val
            );
            val
        } else if self.rom.as_ref().map_or(false, |rom| rom.contains(addr)) {
            // Unwrap guarded by the contains() check above.
            self.rom.as_ref().map(|rom| rom.word_at(addr)).unwrap_or(0)
        } else if addr == self.config.fromhost_addr {
            match self.input.dequeue() {
                Some(byte) if self.config.htif_enabled => (1u64 << 56) | byte as u64,
                _ => 0,
            }
        } else if addr == self.config.sifive_test_addr {
            0
        } else {
            if !QUIET_STRAY_READS.contains(&addr) {
                debug!("stray io read addr 0x{:08x}", addr);
            }
            0
        };

        self.port.put_read_data(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockPort {
        requests: VecDeque<MmioRequest>,
        read_data: Vec<u64>,
        responses: usize,
    }

    impl MockPort {
        fn new() -> Self {
            MockPort {
                requests: VecDeque::new(),
                read_data: Vec::new(),
                responses: 0,
            }
        }
    }

    impl InterceptPort for MockPort {
        fn poll_request(&mut self) -> Result<Option<MmioRequest>> {
            Ok(self.requests.pop_front())
        }

        fn put_read_data(&mut self, data: u64) -> Result<()> {
            self.read_data.push(data);
            Ok(())
        }

        fn send_response(&mut self) -> Result<()> {
            self.responses += 1;
            Ok(())
        }
    }

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FixedHandler(u32);

    impl MmioHandler for FixedHandler {
        fn read(&self, _offset: u64, data: &mut [u8]) {
            data.copy_from_slice(&self.0.to_le_bytes());
        }

        fn write(&self, _offset: u64, _data: &[u8]) {}
    }

    fn write_req(addr: u64, wdata: u64) -> MmioRequest {
        MmioRequest {
            is_write: true,
            addr,
            wdata,
            wstrobe: 0xff,
            read_len: 0,
            req_id: 0,
        }
    }

    fn read_req(addr: u64) -> MmioRequest {
        MmioRequest {
            is_write: false,
            addr,
            wdata: 0,
            wstrobe: 0,
            read_len: 0,
            req_id: 0,
        }
    }

    fn test_router(map: AddressMap) -> (TransactionRouter<MockPort>, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut config = RouterConfig::default();
        config.htif_enabled = true;
        let mut router = TransactionRouter::new(
            MockPort::new(),
            map,
            config,
            Some(BootRom {
                base: 0x7000_0000,
                data: vec![0x1111_2222_3333_4444, 0xaaaa_bbbb_cccc_dddd],
            }),
            Arc::new(HtifInput::new()),
            Arc::new(StopLatch::new()),
        );
        router.set_console_output(Box::new(SharedBuf(out.clone())));
        (router, out)
    }

    #[test]
    fn test_htif_putchar() {
        let (mut router, out) = test_router(AddressMap::new());
        router
            .handle_request(&write_req(0x1000_1000, (1 << 56) | (1 << 48) | 0x41))
            .unwrap();
        assert_eq!(&*out.lock().unwrap(), b"A");
        assert_eq!(router.stop.get(), None);
    }

    #[test]
    fn test_htif_exit_codes() {
        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&write_req(0x1000_1000, 1)).unwrap();
        assert_eq!(router.stop.get(), Some(StopCode::Exit(0)));

        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&write_req(0x1000_1000, 15)).unwrap();
        assert_eq!(router.stop.get(), Some(StopCode::Exit(7)));
    }

    #[test]
    fn test_test_finisher() {
        let (mut router, _) = test_router(AddressMap::new());
        router
            .handle_request(&write_req(0x5000_0000, (7 << 16) | 0x3333))
            .unwrap();
        assert_eq!(router.stop.get(), Some(StopCode::Exit(7)));

        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&write_req(0x5000_0000, 0x5555)).unwrap();
        assert_eq!(router.stop.get(), Some(StopCode::Exit(0)));

        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&write_req(0x5000_0000, 0x7777)).unwrap();
        assert_eq!(router.stop.get(), Some(StopCode::Reset));

        // An unknown status must not latch a stop code.
        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&write_req(0x5000_0000, 0x1234)).unwrap();
        assert_eq!(router.stop.get(), None);
    }

    #[test]
    fn test_fromhost_read() {
        let (mut router, _) = test_router(AddressMap::new());
        router.input.enqueue(b"z");
        router.handle_request(&read_req(0x1000_1008)).unwrap();
        router.handle_request(&read_req(0x1000_1008)).unwrap();
        assert_eq!(router.port.read_data[0], (1 << 56) | b'z' as u64);
        assert_eq!(router.port.read_data[1], 0);
    }

    #[test]
    fn test_fromhost_read_htif_disabled() {
        let (mut router, _) = test_router(AddressMap::new());
        router.config.htif_enabled = false;
        router.input.enqueue(b"z");
        router.handle_request(&read_req(0x1000_1008)).unwrap();
        assert_eq!(router.port.read_data[0], 0);
    }

    #[test]
    fn test_rom_read() {
        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&read_req(0x7000_0008)).unwrap();
        assert_eq!(router.port.read_data[0], 0xaaaa_bbbb_cccc_dddd);
    }

    #[test]
    fn test_device_range_read_lane_shift() {
        let mut map = AddressMap::new();
        map.add(0x4000_0000, 0x1000, Arc::new(FixedHandler(0x74726976)))
            .unwrap();
        let (mut router, _) = test_router(map);

        router.handle_request(&read_req(0x4000_0000)).unwrap();
        assert_eq!(router.port.read_data[0], 0x74726976);

        router.handle_request(&read_req(0x4000_0004)).unwrap();
        assert_eq!(router.port.read_data[1], 0x74726976 << 32);
    }

    #[test]
    fn test_stray_read_returns_zero() {
        let (mut router, _) = test_router(AddressMap::new());
        router.handle_request(&read_req(0x6000_0000)).unwrap();
        assert_eq!(router.port.read_data[0], 0);
    }

    #[test]
    fn test_address_map_rejects_overlap() {
        let mut map = AddressMap::new();
        map.add(0x4000_0000, 0x1000, Arc::new(FixedHandler(0)))
            .unwrap();
        assert!(matches!(
            map.add(0x4000_0800, 0x1000, Arc::new(FixedHandler(0))),
            Err(Error::RangeOverlap(_))
        ));
        map.add(0x4000_1000, 0x1000, Arc::new(FixedHandler(0)))
            .unwrap();
    }

    #[test]
    fn test_run_observes_stop_latch() {
        let (mut router, _) = test_router(AddressMap::new());
        router
            .port
            .requests
            .push_back(write_req(0x5000_0000, (3 << 16) | 0x3333));
        let code = router.run().unwrap();
        assert_eq!(code, StopCode::Exit(3));
        // The triggering transaction completed before the loop exited.
        assert_eq!(router.port.responses, 1);
    }
}
