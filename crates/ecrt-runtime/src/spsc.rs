//! Lock-free single-producer/single-consumer queue of fixed-size slots.
//!
//! The queue hands byte payloads from one thread to another without
//! blocking and without allocating after construction.
//!
//! # Descriptor word
//!
//! All index state lives in one `AtomicU32`:
//!
//! ```text
//!  31      24 23      16 15       8 7        0
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │  count   │   tail   │   head   │  depth   │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The producer fills the slot at `head` and then moves the word from the
//! value it last observed to `{head + 1, count + 1}` with a compare-exchange,
//! re-reading and retrying if the consumer changed the word in between. The
//! consumer mirrors this on `tail`. Every decision re-reads the atomic word.
//!
//! # Threading Model
//!
//! [`channel`] returns a [`Producer`] and a [`Consumer`]. Each is `Send` but
//! neither `Clone` nor `Sync`, so exactly one thread can enqueue and exactly
//! one thread can dequeue.
//!
//! # Zero-copy mode
//!
//! [`Producer::head_slot`] lends the free slot at `head` so a message can be
//! formatted in place and published with [`HeadSlot::commit`].
//! [`Consumer::tail_slot`] lends the oldest message, which is consumed with
//! [`TailSlot::release`]. Dropping either guard leaves the queue unchanged.

use crossbeam_utils::CachePadded;
use ecrt_common::error::{QueueError, RtError, RtResult};
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Largest supported queue depth.
pub const MAX_DEPTH: usize = u8::MAX as usize;

const DEPTH_SHIFT: u32 = 0;
const HEAD_SHIFT: u32 = 8;
const TAIL_SHIFT: u32 = 16;
const COUNT_SHIFT: u32 = 24;

/// Unpacked queue descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Descriptor {
    depth: u8,
    head: u8,
    tail: u8,
    count: u8,
}

impl Descriptor {
    const fn pack(self) -> u32 {
        ((self.depth as u32) << DEPTH_SHIFT)
            | ((self.head as u32) << HEAD_SHIFT)
            | ((self.tail as u32) << TAIL_SHIFT)
            | ((self.count as u32) << COUNT_SHIFT)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn unpack(word: u32) -> Self {
        Self {
            depth: (word >> DEPTH_SHIFT) as u8,
            head: (word >> HEAD_SHIFT) as u8,
            tail: (word >> TAIL_SHIFT) as u8,
            count: (word >> COUNT_SHIFT) as u8,
        }
    }

    const fn is_full(self) -> bool {
        self.count == self.depth
    }

    const fn is_empty(self) -> bool {
        self.count == 0
    }

    const fn wrap(self, index: u8) -> u8 {
        // index < depth <= 255, so index + 1 fits in u16
        ((index as u16 + 1) % self.depth as u16) as u8
    }

    const fn after_enqueue(self) -> Self {
        Self {
            head: self.wrap(self.head),
            count: self.count + 1,
            ..self
        }
    }

    const fn after_dequeue(self) -> Self {
        Self {
            tail: self.wrap(self.tail),
            count: self.count - 1,
            ..self
        }
    }
}

struct Slot {
    len: UnsafeCell<usize>,
    buf: UnsafeCell<Box<[u8]>>,
}

struct Shared {
    descriptor: CachePadded<AtomicU32>,
    slots: Box<[Slot]>,
    slot_size: usize,
}

// SAFETY: A slot is written only by the producer while its index lies outside
// [tail, head) and read only by the consumer while it lies inside. The index
// moves between those ranges through an AcqRel compare-exchange on
// `descriptor`, which orders the slot accesses of the two threads.
#[allow(unsafe_code)]
unsafe impl Sync for Shared {}

impl Shared {
    fn load(&self) -> Descriptor {
        Descriptor::unpack(self.descriptor.load(Ordering::Acquire))
    }

    /// Move the descriptor forward with `step`, retrying on concurrent
    /// changes. Fails with `blocked` if a re-read shows the move is no
    /// longer possible.
    fn advance(
        &self,
        step: fn(Descriptor) -> Descriptor,
        is_blocked: fn(Descriptor) -> bool,
        blocked: QueueError,
    ) -> Result<(), QueueError> {
        let mut current = self.descriptor.load(Ordering::Acquire);
        loop {
            let desc = Descriptor::unpack(current);
            if is_blocked(desc) {
                return Err(blocked);
            }
            match self.descriptor.compare_exchange_weak(
                current,
                step(desc).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn commit_head(&self) -> Result<(), QueueError> {
        self.advance(Descriptor::after_enqueue, Descriptor::is_full, QueueError::Full)
    }

    fn commit_tail(&self) -> Result<(), QueueError> {
        self.advance(
            Descriptor::after_dequeue,
            Descriptor::is_empty,
            QueueError::Empty,
        )
    }

    fn slot(&self, index: u8) -> &Slot {
        &self.slots[usize::from(index)]
    }
}

impl Slot {
    /// Store a message length.
    ///
    /// # Safety
    ///
    /// Caller must be the producer and the slot must be the one at `head`,
    /// which the consumer does not touch until the next commit publishes it.
    #[allow(unsafe_code)]
    unsafe fn set_len(&self, len: usize) {
        *self.len.get() = len;
    }

    /// Writable view of the whole buffer.
    ///
    /// # Safety
    ///
    /// Same contract as [`Slot::set_len`], and no other view of this buffer
    /// may be alive.
    #[allow(unsafe_code, clippy::mut_from_ref)]
    unsafe fn buf_mut(&self) -> &mut [u8] {
        &mut *self.buf.get()
    }

    /// Read-only view of the whole buffer.
    ///
    /// # Safety
    ///
    /// Caller must be the side that currently owns the slot (producer at
    /// `head`, consumer inside `[tail, head)`), with no writable view alive.
    #[allow(unsafe_code)]
    unsafe fn buf(&self) -> &[u8] {
        &*self.buf.get()
    }

    /// The stored message.
    ///
    /// # Safety
    ///
    /// Caller must be the consumer and the slot must be the one at `tail`,
    /// which the producer does not reuse until the consumer frees it.
    #[allow(unsafe_code)]
    unsafe fn message(&self) -> &[u8] {
        let len = *self.len.get();
        let buf: &[u8] = &*self.buf.get();
        &buf[..len]
    }
}

/// Create a queue of `depth` slots, each holding up to `slot_size` bytes.
///
/// All memory is allocated here; the returned ends never allocate.
///
/// # Errors
///
/// Returns [`RtError::QueueAllocation`] if `depth` is not in `1..=255`,
/// `slot_size` is zero, or the slot memory cannot be allocated.
pub fn channel(depth: usize, slot_size: usize) -> RtResult<(Producer, Consumer)> {
    if depth == 0 || depth > MAX_DEPTH {
        return Err(RtError::QueueAllocation(format!(
            "depth {depth} outside 1..={MAX_DEPTH}"
        )));
    }
    if slot_size == 0 {
        return Err(RtError::QueueAllocation("slot size must be non-zero".into()));
    }

    let mut slots = Vec::new();
    slots
        .try_reserve_exact(depth)
        .map_err(|e| RtError::QueueAllocation(e.to_string()))?;
    for _ in 0..depth {
        let mut buf = Vec::new();
        buf.try_reserve_exact(slot_size)
            .map_err(|e| RtError::QueueAllocation(e.to_string()))?;
        buf.resize(slot_size, 0u8);
        slots.push(Slot {
            len: UnsafeCell::new(0),
            buf: UnsafeCell::new(buf.into_boxed_slice()),
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let descriptor = Descriptor {
        depth: depth as u8,
        head: 0,
        tail: 0,
        count: 0,
    };

    let shared = Arc::new(Shared {
        descriptor: CachePadded::new(AtomicU32::new(descriptor.pack())),
        slots: slots.into_boxed_slice(),
        slot_size,
    });

    debug!(depth, slot_size, "SPSC queue created");

    Ok((
        Producer {
            shared: Arc::clone(&shared),
            _not_sync: PhantomData,
        },
        Consumer {
            shared,
            _not_sync: PhantomData,
        },
    ))
}

macro_rules! introspection {
    () => {
        /// Number of messages waiting.
        #[must_use]
        pub fn len(&self) -> usize {
            usize::from(self.shared.load().count)
        }

        /// Returns true if no message is waiting.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.shared.load().is_empty()
        }

        /// Returns true if every slot holds a message.
        #[must_use]
        pub fn is_full(&self) -> bool {
            self.shared.load().is_full()
        }

        /// Number of free slots.
        #[must_use]
        pub fn available(&self) -> usize {
            let desc = self.shared.load();
            usize::from(desc.depth - desc.count)
        }

        /// Total number of slots.
        #[must_use]
        pub fn depth(&self) -> usize {
            usize::from(self.shared.load().depth)
        }

        /// Capacity of each slot in bytes.
        #[must_use]
        pub fn slot_size(&self) -> usize {
            self.shared.slot_size
        }
    };
}

/// Sending end of the queue.
pub struct Producer {
    shared: Arc<Shared>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Producer {
    /// Copy `payload` into the next slot and publish it.
    ///
    /// An empty payload zero-fills the slot and publishes a zero-length
    /// message.
    ///
    /// # Errors
    ///
    /// [`QueueError::PayloadTooLarge`] if `payload` exceeds the slot size,
    /// [`QueueError::Full`] if no slot is free. Neither has side effects.
    #[allow(unsafe_code)]
    pub fn try_enqueue(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        let slot_size = self.shared.slot_size;
        if payload.len() > slot_size {
            return Err(QueueError::PayloadTooLarge {
                len: payload.len(),
                capacity: slot_size,
            });
        }

        let desc = self.shared.load();
        if desc.is_full() {
            return Err(QueueError::Full);
        }

        let slot = self.shared.slot(desc.head);
        // SAFETY: this is the producer and `head` is outside [tail, head).
        unsafe {
            let buf = slot.buf_mut();
            if payload.is_empty() {
                buf.fill(0);
            } else {
                buf[..payload.len()].copy_from_slice(payload);
            }
            slot.set_len(payload.len());
        }

        self.shared.commit_head()
    }

    /// Borrow the free slot at `head` for in-place formatting.
    ///
    /// Returns `None` if the queue is full.
    pub fn head_slot(&mut self) -> Option<HeadSlot<'_>> {
        let desc = self.shared.load();
        if desc.is_full() {
            return None;
        }
        Some(HeadSlot {
            producer: self,
            index: desc.head,
        })
    }

    introspection!();
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("descriptor", &self.shared.load())
            .field("slot_size", &self.shared.slot_size)
            .finish()
    }
}

/// Receiving end of the queue.
pub struct Consumer {
    shared: Arc<Shared>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Consumer {
    /// Copy the oldest message into `out` and release its slot.
    ///
    /// Copies `min(out.len(), message length)` bytes and returns that count;
    /// the rest of a longer message is discarded.
    ///
    /// # Errors
    ///
    /// [`QueueError::Empty`] if no message is waiting.
    #[allow(unsafe_code)]
    pub fn try_dequeue(&mut self, out: &mut [u8]) -> Result<usize, QueueError> {
        let desc = self.shared.load();
        if desc.is_empty() {
            return Err(QueueError::Empty);
        }

        // SAFETY: this is the consumer and `tail` holds a published message.
        let message = unsafe { self.shared.slot(desc.tail).message() };
        let copied = message.len().min(out.len());
        out[..copied].copy_from_slice(&message[..copied]);

        self.shared.commit_tail()?;
        Ok(copied)
    }

    /// Borrow the oldest message without copying it.
    ///
    /// Returns `None` if the queue is empty.
    pub fn tail_slot(&mut self) -> Option<TailSlot<'_>> {
        let desc = self.shared.load();
        if desc.is_empty() {
            return None;
        }
        Some(TailSlot {
            consumer: self,
            index: desc.tail,
        })
    }

    introspection!();
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("descriptor", &self.shared.load())
            .field("slot_size", &self.shared.slot_size)
            .finish()
    }
}

/// The free slot at `head`, lent for in-place writing.
pub struct HeadSlot<'a> {
    producer: &'a mut Producer,
    index: u8,
}

impl HeadSlot<'_> {
    /// Publish the first `len` bytes of the slot as a message.
    ///
    /// # Errors
    ///
    /// [`QueueError::PayloadTooLarge`] if `len` exceeds the slot size.
    #[allow(unsafe_code)]
    pub fn commit(self, len: usize) -> Result<(), QueueError> {
        let shared = &self.producer.shared;
        if len > shared.slot_size {
            return Err(QueueError::PayloadTooLarge {
                len,
                capacity: shared.slot_size,
            });
        }
        // SAFETY: the guard holds the producer exclusively and `index` is `head`.
        unsafe {
            shared.slot(self.index).set_len(len);
        }
        shared.commit_head()
    }
}

impl Deref for HeadSlot<'_> {
    type Target = [u8];

    #[allow(unsafe_code)]
    fn deref(&self) -> &[u8] {
        // SAFETY: the guard holds the producer exclusively and `index` is
        // `head`; a writable view needs `&mut self`, so none is alive.
        unsafe {
            self.producer.shared.slot(self.index).buf()
        }
    }
}

impl DerefMut for HeadSlot<'_> {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`, and `&mut self` rules out any other view.
        unsafe {
            self.producer.shared.slot(self.index).buf_mut()
        }
    }
}

/// The oldest message at `tail`, lent for reading.
pub struct TailSlot<'a> {
    consumer: &'a mut Consumer,
    index: u8,
}

impl TailSlot<'_> {
    /// Consume the message and free its slot.
    pub fn release(self) {
        // The tail slot exists, so the queue holds at least this message and
        // only this thread can remove it.
        let released = self.consumer.shared.commit_tail();
        debug_assert!(released.is_ok(), "tail slot released from an empty queue");
    }
}

impl Deref for TailSlot<'_> {
    type Target = [u8];

    #[allow(unsafe_code)]
    fn deref(&self) -> &[u8] {
        // SAFETY: the guard holds the consumer exclusively and `index` is `tail`.
        unsafe {
            self.consumer.shared.slot(self.index).message()
        }
    }
}

static_assertions::assert_impl_all!(Producer: Send);
static_assertions::assert_impl_all!(Consumer: Send);
static_assertions::assert_not_impl_any!(Producer: Sync, Clone);
static_assertions::assert_not_impl_any!(Consumer: Sync, Clone);
