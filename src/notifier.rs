// SPDX-License-Identifier: Apache-2.0

//! Asynchronous queue-notification worker.
//!
//! Guest writes to a device's queue-notify register must never block in
//! guest code, so the intercept path only sets an atomic bit and signals a
//! condition variable. A single process-wide worker thread wakes up, claims
//! every device's pending-queue bitmap and runs the drain loops.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, warn};

use crate::device::VirtioMmioDevice;
use crate::MAX_QUEUE;

#[derive(Default)]
struct NotifyFlags {
    pending: bool,
    stop: bool,
}

struct Shared {
    flags: Mutex<NotifyFlags>,
    cond: Condvar,
}

/// Producer handle signalling the notification worker. Cloned into every
/// device at construction time.
#[derive(Clone)]
pub struct QueueNotifier {
    shared: Arc<Shared>,
}

impl QueueNotifier {
    pub fn new() -> Self {
        QueueNotifier {
            shared: Arc::new(Shared {
                flags: Mutex::new(NotifyFlags::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Wakes the worker. Callable from the intercept path; only toggles the
    /// flag under the lock and signals.
    pub fn signal(&self) {
        let mut flags = self.shared.flags.lock().unwrap();
        flags.pending = true;
        self.shared.cond.notify_one();
    }
}

impl Default for QueueNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Running worker thread draining pending queue notifications.
pub struct NotifyWorker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NotifyWorker {
    /// Spawns the worker over `devices`, waking on `notifier`.
    pub fn start(
        notifier: QueueNotifier,
        devices: Vec<Arc<VirtioMmioDevice>>,
    ) -> crate::Result<Self> {
        let shared = notifier.shared.clone();
        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("virtio-queues".to_string())
            .spawn(move || run_worker(worker_shared, devices))?;

        Ok(NotifyWorker {
            shared,
            thread: Some(thread),
        })
    }

    /// Asks the worker to exit. The pending flag is raised together with the
    /// stop flag so the worker observes the request even when idle.
    pub fn stop(&self) {
        let mut flags = self.shared.flags.lock().unwrap();
        flags.pending = true;
        flags.stop = true;
        self.shared.cond.notify_one();
    }

    /// Waits for the worker thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("virtio queue worker panicked");
            }
        }
    }
}

impl Drop for NotifyWorker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_worker(shared: Arc<Shared>, devices: Vec<Arc<VirtioMmioDevice>>) {
    loop {
        {
            let mut flags = shared.flags.lock().unwrap();
            while !flags.pending {
                flags = shared.cond.wait(flags).unwrap();
            }
            if flags.stop {
                return;
            }
            // Clear under the lock; any notify from here on re-arms us.
            flags.pending = false;
        }

        for dev in devices.iter() {
            // The bitmap must be claimed before draining: clearing bits
            // after the drain would lose a notify that raced with it.
            let mut pending = dev.take_pending_notify();
            for queue_idx in 0..MAX_QUEUE as u16 {
                if pending == 0 {
                    break;
                }
                if pending & (1 << queue_idx) != 0 {
                    pending &= !(1 << queue_idx);
                    if let Err(e) = dev.drain_queue(queue_idx) {
                        debug!("{}: drain of queue {} failed: {}", dev.name(), queue_idx, e);
                    }
                }
            }
        }
    }
}
