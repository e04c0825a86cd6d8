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
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::midi::Message;

/// The default number of slots in an event queue.
pub const DEFAULT_CAPACITY: usize = 128;

const FREE: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

struct Slot {
    state: AtomicU8,
    message: AtomicU32,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            state: AtomicU8::new(FREE),
            message: AtomicU32::new(0),
        }
    }
}

/// A fixed size table of outgoing messages. Any thread may enqueue. Only the process callback
/// may call [EventQueue::take]. Nothing here blocks or allocates after construction.
pub struct EventQueue {
    slots: Box<[Slot]>,
    channel: AtomicU8,
}

impl EventQueue {
    /// Creates a queue with the given number of slots (at least one).
    pub fn new(capacity: usize) -> EventQueue {
        EventQueue {
            slots: (0..capacity.max(1)).map(|_| Slot::new()).collect(),
            channel: AtomicU8::new(0),
        }
    }

    /// Queues a message for the next process cycle, retargeted to the queue's channel.
    ///
    /// If an identical message is already pending, this succeeds without adding a second copy.
    /// Returns false if every slot is taken. The caller is expected to drop the message.
    pub fn enqueue(&self, message: Message) -> bool {
        let message = message.with_channel(self.channel());
        let packed = message.pack();

        loop {
            let mut free = None;
            for (index, slot) in self.slots.iter().enumerate() {
                match slot.state.load(Ordering::Acquire) {
                    READY if slot.message.load(Ordering::Relaxed) == packed => return true,
                    FREE if free.is_none() => free = Some(index),
                    _ => {}
                }
            }

            let Some(index) = free else {
                return false;
            };

            let slot = &self.slots[index];
            if slot
                .state
                .compare_exchange(FREE, WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.message.store(packed, Ordering::Relaxed);
                slot.state.store(READY, Ordering::Release);
                return true;
            }
            // Another producer claimed the slot between the scan and the exchange.
        }
    }

    /// Returns the index of the next pending slot after the given index, or the first
    /// pending slot if no index is given.
    pub fn next(&self, after: Option<usize>) -> Option<usize> {
        let start = after.map_or(0, |index| index + 1);
        (start..self.slots.len())
            .find(|index| self.slots[*index].state.load(Ordering::Acquire) == READY)
    }

    /// Reads a pending message without releasing its slot.
    pub fn peek(&self, index: usize) -> Option<Message> {
        let slot = self.slots.get(index)?;
        if slot.state.load(Ordering::Acquire) != READY {
            return None;
        }
        Some(Message::unpack(slot.message.load(Ordering::Relaxed)))
    }

    /// Copies a pending message out and frees its slot. Single consumer only.
    pub fn take(&self, index: usize) -> Option<Message> {
        let message = self.peek(index)?;
        self.slots[index].state.store(FREE, Ordering::Release);
        Some(message)
    }

    /// The number of messages waiting to be sent.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == READY)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The channel applied to messages as they are queued.
    pub fn channel(&self) -> u8 {
        self.channel.load(Ordering::Relaxed)
    }

    /// Sets the channel applied to messages queued from now on.
    pub fn set_channel(&self, channel: u8) {
        self.channel.store(channel & 0x0F, Ordering::Relaxed);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new(DEFAULT_CAPACITY)
    }
}
