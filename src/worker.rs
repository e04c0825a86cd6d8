// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, error};

pub mod timer;

/// A closure used to unblock a worker's body when it is asked to stop.
type Wake = Box<dyn Fn() + Send + Sync>;

/// A named background thread with a start/stop/is_running lifecycle. Stopping a worker that
/// was never started, or stopping it twice, does nothing.
pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    wake: Wake,
}

impl Worker {
    /// Creates a worker whose body only needs to be unparked to notice a stop request.
    pub fn new(name: &str) -> Worker {
        Worker::with_wake(name, || {})
    }

    /// Creates a worker with an extra wake action, called on stop before joining. Use this
    /// when the body blocks on something other than thread parking.
    pub fn with_wake<F>(name: &str, wake: F) -> Worker
    where
        F: Fn() + Send + Sync + 'static,
    {
        Worker {
            name: name.to_string(),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            wake: Box::new(wake),
        }
    }

    /// Starts the body on a new thread, stopping any previous run first. The body receives
    /// the running flag and should return once it reads false.
    pub fn start<F>(&self, body: F) -> Result<(), io::Error>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        self.stop();

        let mut handle = self.handle.lock();
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        match thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || body(running))
        {
            Ok(join) => {
                *handle = Some(join);
                debug!(worker = self.name, "Worker started.");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Requests the body to exit and waits for it.
    pub fn stop(&self) {
        let mut handle = self.handle.lock();
        self.running.store(false, Ordering::Release);

        let Some(join) = handle.take() else {
            return;
        };

        (self.wake)();
        join.thread().unpark();
        if join.join().is_err() {
            error!(worker = self.name, "Worker panicked.");
        } else {
            debug!(worker = self.name, "Worker stopped.");
        }
    }

    /// True between a successful start and the next stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.handle.lock().is_some()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
