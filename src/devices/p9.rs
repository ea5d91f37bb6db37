// SPDX-License-Identifier: Apache-2.0

//! Virtio 9P transport device, speaking 9P2000.L against a filesystem
//! backend.
//!
//! One request queue. Each chain carries a little-endian message
//! `{size: u32, op: u8, tag: u16, ...}` in its readable portion; the reply
//! goes to the writable portion with the opcode incremented by one.
//! Protocol errors and unknown FIDs are answered with `Rlerror` carrying a
//! POSIX errno, never propagated to the transport. `lopen` may complete
//! asynchronously through the same single-request backpressure scheme as
//! the block device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;

use crate::bus::VirtioBus;
use crate::device::{DeviceParams, RecvOutcome, VirtioBackend, VirtioMmioDevice};
use crate::queue::DescChain;
use crate::{Error, Result, TYPE_9P};

/// Device exposes a mount tag through the config space.
const VIRTIO_9P_F_MOUNT_TAG: u64 = 0;

const PROTOCOL_VERSION: &str = "9P2000.L";

/// Reply headroom subtracted from the negotiated msize for I/O units.
const IOUNIT_HEADROOM: u32 = 24;

// 9P2000.L request opcodes; replies are the opcode plus one.
const TSTATFS: u8 = 8;
const TLOPEN: u8 = 12;
const TLCREATE: u8 = 14;
const TSYMLINK: u8 = 16;
const TMKNOD: u8 = 18;
const TREADLINK: u8 = 22;
const TGETATTR: u8 = 24;
const TSETATTR: u8 = 26;
const TXATTRWALK: u8 = 30;
const TREADDIR: u8 = 40;
const TFSYNC: u8 = 50;
const TLOCK: u8 = 52;
const TGETLOCK: u8 = 54;
const TLINK: u8 = 70;
const TMKDIR: u8 = 72;
const TRENAMEAT: u8 = 74;
const TUNLINKAT: u8 = 76;
const TVERSION: u8 = 100;
const TATTACH: u8 = 104;
const TFLUSH: u8 = 108;
const TWALK: u8 = 110;
const TREAD: u8 = 116;
const TWRITE: u8 = 118;
const TCLUNK: u8 = 120;

const RLERROR: u8 = 6;

/// File identity as seen by the guest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Qid {
    pub kind: u8,
    pub version: u32,
    pub path: u64,
}

/// Filesystem totals for statfs.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatFs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

/// Attributes returned by getattr.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileAttr {
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
}

/// POSIX record lock description.
#[derive(Clone, Debug, Default)]
pub struct FsLock {
    pub kind: u8,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

/// Backend results carry a positive POSIX errno on failure, which goes out
/// on the wire in the Rlerror reply.
pub type FsResult<T> = std::result::Result<T, i32>;

/// Continuation finishing an open that the backend parked. Synchronous
/// backends call [`complete`](OpenCompletion::complete) inline.
pub struct OpenCompletion {
    chain: DescChain,
    tag: u16,
    msize: u32,
    req_in_progress: Arc<AtomicBool>,
    requeue_dev: Arc<Mutex<Weak<VirtioMmioDevice>>>,
}

impl OpenCompletion {
    pub fn complete(self, result: FsResult<Qid>) {
        let sent = match result {
            Ok(qid) => {
                let mut w = MsgWriter::new();
                w.qid(&qid);
                w.u32(self.msize.saturating_sub(IOUNIT_HEADROOM));
                send_reply(&self.chain, TLOPEN, self.tag, &w.buf)
            }
            Err(errno) => send_error(&self.chain, self.tag, errno),
        };
        if let Err(e) = sent {
            debug!("virtio-9p: dropping open reply: {}", e);
        }
        self.req_in_progress.store(false, Ordering::Release);
        if let Some(dev) = self.requeue_dev.lock().unwrap().upgrade() {
            dev.notify_queue(self.chain.queue_idx);
        }
    }
}

/// Filesystem behind the 9P device. Handles are opaque to the transport;
/// the device owns the FID table mapping guest FIDs onto them.
///
/// Unimplemented operations answer ENOTSUP by default.
pub trait FsBackend: Send + 'static {
    type File: Send;

    fn attach(&mut self, uid: u32, uname: &str, aname: &str) -> FsResult<(Self::File, Qid)>;

    fn statfs(&mut self) -> FsResult<StatFs> {
        Err(libc::ENOTSUP)
    }

    /// Opens `file` in place and eventually resolves `done`, either inline
    /// or from another thread once the backing store is ready.
    fn open(&mut self, _file: &mut Self::File, _flags: u32, done: OpenCompletion) {
        done.complete(Err(libc::ENOTSUP));
    }

    /// Turns the directory handle into the newly created file.
    fn create(
        &mut self,
        _dir: &mut Self::File,
        _name: &str,
        _flags: u32,
        _mode: u32,
        _gid: u32,
    ) -> FsResult<Qid> {
        Err(libc::ENOTSUP)
    }

    fn symlink(&mut self, _dir: &Self::File, _name: &str, _target: &str, _gid: u32) -> FsResult<Qid> {
        Err(libc::ENOTSUP)
    }

    fn mknod(
        &mut self,
        _dir: &Self::File,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> FsResult<Qid> {
        Err(libc::ENOTSUP)
    }

    fn readlink(&mut self, _file: &Self::File) -> FsResult<String> {
        Err(libc::ENOTSUP)
    }

    fn getattr(&mut self, _file: &Self::File) -> FsResult<FileAttr> {
        Err(libc::ENOTSUP)
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _file: &mut Self::File,
        _mask: u32,
        _mode: u32,
        _uid: u32,
        _gid: u32,
        _size: u64,
        _atime: (u64, u64),
        _mtime: (u64, u64),
    ) -> FsResult<()> {
        Err(libc::ENOTSUP)
    }

    /// Returns packed dirent records starting at `offset`, at most `count`
    /// bytes.
    fn readdir(&mut self, _file: &mut Self::File, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(libc::ENOTSUP)
    }

    /// Returns the lock status byte.
    fn lock(&mut self, _file: &Self::File, _lock: &FsLock) -> FsResult<u8> {
        Err(libc::ENOTSUP)
    }

    fn getlock(&mut self, _file: &Self::File, lock: FsLock) -> FsResult<FsLock> {
        let _ = lock;
        Err(libc::ENOTSUP)
    }

    fn link(&mut self, _dir: &Self::File, _file: &Self::File, _name: &str) -> FsResult<()> {
        Err(libc::ENOTSUP)
    }

    fn mkdir(&mut self, _dir: &Self::File, _name: &str, _mode: u32, _gid: u32) -> FsResult<Qid> {
        Err(libc::ENOTSUP)
    }

    fn renameat(
        &mut self,
        _old_dir: &Self::File,
        _old_name: &str,
        _new_dir: &Self::File,
        _new_name: &str,
    ) -> FsResult<()> {
        Err(libc::ENOTSUP)
    }

    fn unlinkat(&mut self, _dir: &Self::File, _name: &str, _flags: u32) -> FsResult<()> {
        Err(libc::ENOTSUP)
    }

    /// Walks `names` from `from`, returning the destination handle and the
    /// qids of every element reached. A partial walk returns fewer qids
    /// than names without being an error.
    fn walk(&mut self, _from: &Self::File, _names: &[String]) -> FsResult<(Self::File, Vec<Qid>)> {
        Err(libc::ENOTSUP)
    }

    fn read(&mut self, _file: &mut Self::File, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(libc::ENOTSUP)
    }

    fn write(&mut self, _file: &mut Self::File, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(libc::ENOTSUP)
    }

    /// Releases a handle the guest clunked or displaced.
    fn close(&mut self, _file: Self::File) {}
}

/// Cursor over a request's readable portion.
struct MsgReader<'a> {
    chain: &'a DescChain,
    offset: usize,
}

impl<'a> MsgReader<'a> {
    fn u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.chain.read_from(self.offset, &mut buf)?;
        self.offset += 1;
        Ok(buf[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.chain.read_from(self.offset, &mut buf)?;
        self.offset += 2;
        Ok(LittleEndian::read_u16(&buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.chain.read_from(self.offset, &mut buf)?;
        self.offset += 4;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.chain.read_from(self.offset, &mut buf)?;
        self.offset += 8;
        Ok(LittleEndian::read_u64(&buf))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        self.chain.read_from(self.offset, &mut buf)?;
        self.offset += len;
        String::from_utf8(buf).map_err(|_| Error::InvalidInput)
    }

    fn bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.chain.read_from(self.offset, &mut buf)?;
        self.offset += count;
        Ok(buf)
    }
}

/// Little-endian reply payload under construction.
struct MsgWriter {
    buf: Vec<u8>,
}

impl MsgWriter {
    fn new() -> Self {
        MsgWriter { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn qid(&mut self, qid: &Qid) {
        self.u8(qid.kind);
        self.u32(qid.version);
        self.u64(qid.path);
    }
}

/// Writes `{size, op + 1, tag, payload}` to the chain and publishes it.
fn send_reply(chain: &DescChain, op: u8, tag: u16, payload: &[u8]) -> Result<()> {
    let total = 7 + payload.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_le_bytes());
    msg.push(op + 1);
    msg.extend_from_slice(&tag.to_le_bytes());
    msg.extend_from_slice(payload);
    chain.write_to(0, &msg)?;
    chain.publish(total as u32)
}

fn send_error(chain: &DescChain, tag: u16, errno: i32) -> Result<()> {
    let mut w = MsgWriter::new();
    w.u32(errno as u32);
    send_reply(chain, RLERROR, tag, &w.buf)
}

fn eproto(_: Error) -> i32 {
    libc::EPROTO
}

struct Virtio9p<F: FsBackend> {
    fs: F,
    fids: HashMap<u32, F::File>,
    msize: u32,
    req_in_progress: Arc<AtomicBool>,
    requeue_dev: Arc<Mutex<Weak<VirtioMmioDevice>>>,
}

impl<F: FsBackend> Virtio9p<F> {
    /// Binds `fid` to `file`, releasing any handle it displaces.
    fn fid_set(&mut self, fid: u32, file: F::File) {
        if let Some(old) = self.fids.insert(fid, file) {
            self.fs.close(old);
        }
    }

    fn handle(&mut self, chain: DescChain) -> Result<()> {
        let mut header = [0u8; 7];
        if chain.read_from(0, &mut header).is_err() {
            return send_error(&chain, 0, libc::EPROTO);
        }
        let op = header[4];
        let tag = LittleEndian::read_u16(&header[5..7]);

        if op == TLOPEN {
            return self.lopen(chain, tag);
        }

        let mut rd = MsgReader { chain: &chain, offset: 7 };
        match self.dispatch(op, &mut rd) {
            Ok(payload) => send_reply(&chain, op, tag, &payload),
            Err(errno) => send_error(&chain, tag, errno),
        }
    }

    fn lopen(&mut self, chain: DescChain, tag: u16) -> Result<()> {
        let mut rd = MsgReader { chain: &chain, offset: 7 };
        let parsed = rd.u32().and_then(|fid| rd.u32().map(|flags| (fid, flags)));
        let (fid, flags) = match parsed {
            Ok(v) => v,
            Err(_) => return send_error(&chain, tag, libc::EPROTO),
        };

        match self.fids.get_mut(&fid) {
            None => send_error(&chain, tag, libc::EPROTO),
            Some(file) => {
                let done = OpenCompletion {
                    chain,
                    tag,
                    msize: self.msize,
                    req_in_progress: self.req_in_progress.clone(),
                    requeue_dev: self.requeue_dev.clone(),
                };
                self.req_in_progress.store(true, Ordering::Release);
                self.fs.open(file, flags, done);
                Ok(())
            }
        }
    }

    /// Table-driven operation dispatch. Returns the reply payload, or the
    /// errno for an Rlerror reply.
    fn dispatch(&mut self, op: u8, rd: &mut MsgReader) -> FsResult<Vec<u8>> {
        let mut w = MsgWriter::new();
        match op {
            TSTATFS => {
                let st = self.fs.statfs()?;
                w.u32(0); // fs type
                w.u32(st.bsize);
                w.u64(st.blocks);
                w.u64(st.bfree);
                w.u64(st.bavail);
                w.u64(st.files);
                w.u64(st.ffree);
                w.u64(0); // fsid
                w.u32(256); // maximum filename length
            }
            TLCREATE => {
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let flags = rd.u32().map_err(eproto)?;
                let mode = rd.u32().map_err(eproto)?;
                let gid = rd.u32().map_err(eproto)?;
                let file = self.fids.get_mut(&fid).ok_or(libc::EPROTO)?;
                let qid = self.fs.create(file, &name, flags, mode, gid)?;
                w.qid(&qid);
                w.u32(self.msize.saturating_sub(IOUNIT_HEADROOM));
            }
            TSYMLINK => {
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let target = rd.string().map_err(eproto)?;
                let gid = rd.u32().map_err(eproto)?;
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let qid = self.fs.symlink(file, &name, &target, gid)?;
                w.qid(&qid);
            }
            TMKNOD => {
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let mode = rd.u32().map_err(eproto)?;
                let major = rd.u32().map_err(eproto)?;
                let minor = rd.u32().map_err(eproto)?;
                let gid = rd.u32().map_err(eproto)?;
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let qid = self.fs.mknod(file, &name, mode, major, minor, gid)?;
                w.qid(&qid);
            }
            TREADLINK => {
                let fid = rd.u32().map_err(eproto)?;
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let target = self.fs.readlink(file)?;
                w.string(&target);
            }
            TGETATTR => {
                let fid = rd.u32().map_err(eproto)?;
                let mask = rd.u64().map_err(eproto)?;
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let attr = self.fs.getattr(file)?;
                w.u64(mask);
                w.qid(&attr.qid);
                w.u32(attr.mode);
                w.u32(attr.uid);
                w.u32(attr.gid);
                w.u64(attr.nlink);
                w.u64(attr.rdev);
                w.u64(attr.size);
                w.u64(attr.blksize);
                w.u64(attr.blocks);
                w.u64(attr.atime_sec);
                w.u64(attr.atime_nsec);
                w.u64(attr.mtime_sec);
                w.u64(attr.mtime_nsec);
                w.u64(attr.ctime_sec);
                w.u64(attr.ctime_nsec);
                // btime and generation, unsupported.
                w.u64(0);
                w.u64(0);
                w.u64(0);
                w.u64(0);
            }
            TSETATTR => {
                let fid = rd.u32().map_err(eproto)?;
                let mask = rd.u32().map_err(eproto)?;
                let mode = rd.u32().map_err(eproto)?;
                let uid = rd.u32().map_err(eproto)?;
                let gid = rd.u32().map_err(eproto)?;
                let size = rd.u64().map_err(eproto)?;
                let atime_sec = rd.u64().map_err(eproto)?;
                let atime_nsec = rd.u64().map_err(eproto)?;
                let mtime_sec = rd.u64().map_err(eproto)?;
                let mtime_nsec = rd.u64().map_err(eproto)?;
                let file = self.fids.get_mut(&fid).ok_or(libc::EPROTO)?;
                self.fs.setattr(
                    file,
                    mask,
                    mode,
                    uid,
                    gid,
                    size,
                    (atime_sec, atime_nsec),
                    (mtime_sec, mtime_nsec),
                )?;
            }
            TXATTRWALK => return Err(libc::ENOTSUP),
            TREADDIR => {
                let fid = rd.u32().map_err(eproto)?;
                let offset = rd.u64().map_err(eproto)?;
                let count = rd.u32().map_err(eproto)?;
                let file = self.fids.get_mut(&fid).ok_or(libc::EPROTO)?;
                let data = self.fs.readdir(file, offset, count)?;
                w.u32(data.len() as u32);
                w.buf.extend_from_slice(&data);
            }
            TFSYNC => {
                let _fid = rd.u32().map_err(eproto)?;
                // Nothing is cached; fsync succeeds immediately.
            }
            TLOCK => {
                let fid = rd.u32().map_err(eproto)?;
                let lock = FsLock {
                    kind: rd.u8().map_err(eproto)?,
                    flags: rd.u32().map_err(eproto)?,
                    start: rd.u64().map_err(eproto)?,
                    length: rd.u64().map_err(eproto)?,
                    proc_id: rd.u32().map_err(eproto)?,
                    client_id: rd.string().map_err(eproto)?,
                };
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let status = self.fs.lock(file, &lock)?;
                w.u8(status);
            }
            TGETLOCK => {
                let fid = rd.u32().map_err(eproto)?;
                let lock = FsLock {
                    kind: rd.u8().map_err(eproto)?,
                    flags: 0,
                    start: rd.u64().map_err(eproto)?,
                    length: rd.u64().map_err(eproto)?,
                    proc_id: rd.u32().map_err(eproto)?,
                    client_id: rd.string().map_err(eproto)?,
                };
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let lock = self.fs.getlock(file, lock)?;
                w.u8(lock.kind);
                w.u64(lock.start);
                w.u64(lock.length);
                w.u32(lock.proc_id);
                w.string(&lock.client_id);
            }
            TLINK => {
                let dfid = rd.u32().map_err(eproto)?;
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let dir = self.fids.get(&dfid).ok_or(libc::EPROTO)?;
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                self.fs.link(dir, file, &name)?;
            }
            TMKDIR => {
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let mode = rd.u32().map_err(eproto)?;
                let gid = rd.u32().map_err(eproto)?;
                let file = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let qid = self.fs.mkdir(file, &name, mode, gid)?;
                w.qid(&qid);
            }
            TRENAMEAT => {
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let new_fid = rd.u32().map_err(eproto)?;
                let new_name = rd.string().map_err(eproto)?;
                let old_dir = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let new_dir = self.fids.get(&new_fid).ok_or(libc::EPROTO)?;
                self.fs.renameat(old_dir, &name, new_dir, &new_name)?;
            }
            TUNLINKAT => {
                let fid = rd.u32().map_err(eproto)?;
                let name = rd.string().map_err(eproto)?;
                let flags = rd.u32().map_err(eproto)?;
                let dir = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                self.fs.unlinkat(dir, &name, flags)?;
            }
            TVERSION => {
                let msize = rd.u32().map_err(eproto)?;
                let _version = rd.string().map_err(eproto)?;
                self.msize = msize;
                w.u32(self.msize);
                w.string(PROTOCOL_VERSION);
            }
            TATTACH => {
                let fid = rd.u32().map_err(eproto)?;
                let _afid = rd.u32().map_err(eproto)?;
                let uname = rd.string().map_err(eproto)?;
                let aname = rd.string().map_err(eproto)?;
                let uid = rd.u32().map_err(eproto)?;
                let (file, qid) = self.fs.attach(uid, &uname, &aname)?;
                self.fid_set(fid, file);
                w.qid(&qid);
            }
            TFLUSH => {
                let _oldtag = rd.u16().map_err(eproto)?;
                // Requests complete synchronously or hold the queue, so
                // there is never anything in flight to cancel.
            }
            TWALK => {
                let fid = rd.u32().map_err(eproto)?;
                let new_fid = rd.u32().map_err(eproto)?;
                let nwname = rd.u16().map_err(eproto)?;
                let mut names = Vec::with_capacity(nwname as usize);
                for _ in 0..nwname {
                    names.push(rd.string().map_err(eproto)?);
                }
                let from = self.fids.get(&fid).ok_or(libc::EPROTO)?;
                let (file, qids) = self.fs.walk(from, &names)?;
                w.u16(qids.len() as u16);
                for qid in qids.iter() {
                    w.qid(qid);
                }
                self.fid_set(new_fid, file);
            }
            TREAD => {
                let fid = rd.u32().map_err(eproto)?;
                let offset = rd.u64().map_err(eproto)?;
                let count = rd.u32().map_err(eproto)?;
                let file = self.fids.get_mut(&fid).ok_or(libc::EPROTO)?;
                let data = self.fs.read(file, offset, count)?;
                w.u32(data.len() as u32);
                w.buf.extend_from_slice(&data);
            }
            TWRITE => {
                let fid = rd.u32().map_err(eproto)?;
                let offset = rd.u64().map_err(eproto)?;
                let count = rd.u32().map_err(eproto)?;
                let data = rd.bytes(count as usize).map_err(eproto)?;
                let file = self.fids.get_mut(&fid).ok_or(libc::EPROTO)?;
                let written = self.fs.write(file, offset, &data)?;
                w.u32(written);
            }
            TCLUNK => {
                let fid = rd.u32().map_err(eproto)?;
                if let Some(file) = self.fids.remove(&fid) {
                    self.fs.close(file);
                }
            }
            other => {
                warn!("virtio-9p: unsupported operation {}", other);
                return Err(libc::EPROTO);
            }
        }
        Ok(w.buf)
    }
}

impl<F: FsBackend> VirtioBackend for Virtio9p<F> {
    fn recv(&mut self, chain: DescChain) -> Result<RecvOutcome> {
        if chain.queue_idx != 0 {
            return Ok(RecvOutcome::Done);
        }
        if self.req_in_progress.load(Ordering::Acquire) {
            return Ok(RecvOutcome::Backpressure);
        }
        self.handle(chain)?;
        Ok(RecvOutcome::Done)
    }
}

/// Handle to a registered 9P device.
pub struct P9Device {
    dev: Arc<VirtioMmioDevice>,
}

impl P9Device {
    /// Creates a 9P device exporting `fs` under `mount_tag`.
    pub fn create<F: FsBackend>(bus: &mut VirtioBus, fs: F, mount_tag: &str) -> Result<P9Device> {
        let tag = mount_tag.as_bytes();
        let mut config_space = Vec::with_capacity(2 + tag.len());
        config_space.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        config_space.extend_from_slice(tag);

        let features = (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_9P_F_MOUNT_TAG);
        let params = DeviceParams::new("virtio-9p", TYPE_9P, features, config_space);

        let req_in_progress = Arc::new(AtomicBool::new(false));
        let requeue_dev = Arc::new(Mutex::new(Weak::new()));
        let backend = Virtio9p {
            fs,
            fids: HashMap::new(),
            msize: 8192,
            req_in_progress,
            requeue_dev: requeue_dev.clone(),
        };
        let dev = bus.register(params, Box::new(backend))?;
        *requeue_dev.lock().unwrap() = Arc::downgrade(&dev);
        Ok(P9Device { dev })
    }

    pub fn device(&self) -> &Arc<VirtioMmioDevice> {
        &self.dev
    }
}
