use std::collections::VecDeque;
use crate::seq_num::SeqNum;
use crate::tick::Tick;

/// Fixed-capacity FIFO of records. Pushing into a full ring fails and hands the record back,
///  it never grows or overwrites.
#[derive(Debug)]
pub struct RecordRing<T> {
    records: VecDeque<T>,
    capacity: usize,
}

impl<T> RecordRing<T> {
    pub fn with_capacity(capacity: usize) -> RecordRing<T> {
        RecordRing {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity - self.records.len()
    }

    pub fn push(&mut self, record: T) -> Result<(), T> {
        if self.is_full() {
            return Err(record);
        }
        self.records.push_back(record);
        Ok(())
    }

    pub fn front(&self) -> Option<&T> {
        self.records.front()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.records.pop_front()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.records.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// A reliable record waiting in the send ring
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRecord {
    pub seq: SeqNum,
    /// tick of enqueueing
    pub when: Tick,
    pub data: Vec<u8>,
}

/// A message waiting in the receive ring for the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub data: Vec<u8>,
    /// tick of arrival
    pub when: Tick,
}

/// The send ring, split by a cursor into records that were sent at least once (and await
///  acknowledgement) and records that were never sent:
///
/// ```ascii
/// front                 unsent                 back
///   | sent, unacked ... | never sent ...         |
/// ```
#[derive(Debug)]
pub struct SendRing {
    ring: RecordRing<SendRecord>,
    unsent: usize,
}

impl SendRing {
    pub fn with_capacity(capacity: usize) -> SendRing {
        SendRing {
            ring: RecordRing::with_capacity(capacity),
            unsent: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn push(&mut self, record: SendRecord) -> Result<(), SendRecord> {
        self.ring.push(record)
    }

    /// index of the first record that was not sent yet
    pub fn unsent_idx(&self) -> usize {
        self.unsent
    }

    pub fn has_unsent(&self) -> bool {
        self.unsent < self.ring.len()
    }

    pub fn has_unacked(&self) -> bool {
        self.unsent > 0
    }

    /// sum of payload bytes sent but not acknowledged
    pub fn unacked_bytes(&self) -> usize {
        self.ring.iter()
            .take(self.unsent)
            .map(|r| r.data.len())
            .sum()
    }

    pub fn get(&self, idx: usize) -> Option<&SendRecord> {
        self.ring.get(idx)
    }

    pub fn newest_unacked(&self) -> Option<&SendRecord> {
        self.unsent.checked_sub(1)
            .and_then(|idx| self.ring.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendRecord> {
        self.ring.iter()
    }

    pub fn front(&self) -> Option<&SendRecord> {
        self.ring.front()
    }

    /// moves the cursor past `n` more records
    pub fn mark_sent(&mut self, n: usize) {
        self.unsent = (self.unsent + n).min(self.ring.len());
    }

    /// Drops the oldest record after it was acknowledged. After a NAK rewound the cursor, an ack
    ///  can cover records in front of the cursor, which then stays at the front.
    pub fn retire_front(&mut self) -> Option<SendRecord> {
        let result = self.ring.pop()?;
        self.unsent = self.unsent.saturating_sub(1);
        Some(result)
    }

    /// everything not yet acknowledged is sent again
    pub fn rewind(&mut self) {
        self.unsent = 0;
    }

    /// the newest unacknowledged record is sent again with the next output
    pub fn step_back(&mut self) {
        self.unsent = self.unsent.saturating_sub(1);
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.unsent = 0;
    }
}
