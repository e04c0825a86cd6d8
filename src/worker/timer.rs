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
use std::{io, sync::atomic::Ordering, thread, time::Duration};

use super::Worker;

/// Calls a callback at a fixed interval on its own thread until stopped.
pub struct Timer {
    worker: Worker,
}

impl Timer {
    pub fn new(name: &str) -> Timer {
        Timer {
            worker: Worker::new(name),
        }
    }

    /// Starts calling the callback, then sleeping for the interval, until stopped. A running
    /// timer is stopped and restarted with the new callback.
    pub fn start<F>(&self, interval: Duration, mut callback: F) -> Result<(), io::Error>
    where
        F: FnMut() + Send + 'static,
    {
        self.worker.start(move |running| {
            while running.load(Ordering::Acquire) {
                callback();
                thread::park_timeout(interval);
            }
        })
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}
