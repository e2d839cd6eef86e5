//! Bounded queue of fixed-size messages.
//!
//! ```text
//!            tail              head
//!             │                 │
//!   buffer: [ m3 ][ m4 ][ m5 ][    ][    ]      capacity = 5
//!
//!   send: prod.down ─► mutex.down ─► copy at head ─► mutex.up ─► cons.up
//!   recv: cons.down ─► mutex.down ─► copy at tail ─► mutex.up ─► prod.up
//! ```
//!
//! `prod` counts free slots, `cons` counts filled ones. Senders block on a
//! full queue and receivers on an empty one.

use core::cell::{Cell, RefCell};

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::sync::semaphore::Semaphore;

#[derive(Debug)]
struct Ring {
    buffer: Vec<u8>,
    head: usize,
    tail: usize,
    length: usize,
}

/// Bounded FIFO of `capacity` messages of `msg_size` bytes each.
#[derive(Debug)]
pub struct MessageQueue {
    capacity: usize,
    msg_size: usize,
    ring: RefCell<Ring>,
    prod: Semaphore,
    cons: Semaphore,
    mutex: Semaphore,
    destroyed: Cell<bool>,
}

impl MessageQueue {
    /// Allocate room for `capacity` messages of `msg_size` bytes.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if either size is zero or too large for
    ///   the semaphore counters.
    /// - [`Error::OutOfMemory`] if the buffer cannot be allocated.
    pub fn new(kernel: &Kernel, capacity: usize, msg_size: usize) -> Result<Self> {
        if capacity == 0 || msg_size == 0 {
            log::warn!("message queue rejected: capacity {capacity}, message size {msg_size}");
            return Err(Error::InvalidArgument("capacity and message size must be non-zero"));
        }
        let slots = i32::try_from(capacity)
            .map_err(|_| Error::InvalidArgument("capacity exceeds i32::MAX"))?;
        let bytes = capacity.checked_mul(msg_size).ok_or(Error::OutOfMemory)?;

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(bytes).map_err(|_| Error::OutOfMemory)?;
        buffer.resize(bytes, 0u8);

        Ok(Self {
            capacity,
            msg_size,
            ring: RefCell::new(Ring {
                buffer,
                head: 0,
                tail: 0,
                length: 0,
            }),
            prod: Semaphore::new(kernel, slots),
            cons: Semaphore::new(kernel, 0),
            mutex: Semaphore::new(kernel, 1),
            destroyed: Cell::new(false),
        })
    }

    /// Append a message, blocking while the queue is full.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] unless `msg` is exactly `msg_size`
    ///   bytes.
    /// - [`Error::Destroyed`] if the queue is, or while waiting becomes,
    ///   destroyed.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        self.check_alive()?;
        if msg.len() != self.msg_size {
            return Err(Error::InvalidArgument("message length differs from msg_size"));
        }

        self.prod.down()?;
        self.mutex.down()?;
        {
            let mut ring = self.ring.borrow_mut();
            let at = ring.head * self.msg_size;
            ring.buffer[at..at + self.msg_size].copy_from_slice(msg);
            ring.head = (ring.head + 1) % self.capacity;
            ring.length += 1;
        }
        self.mutex.up()?;
        self.cons.up()
    }

    /// Remove the oldest message into `buf`, blocking while the queue is
    /// empty. `buf` must hold at least `msg_size` bytes; exactly that many
    /// are written.
    ///
    /// # Errors
    /// As for [`send`](Self::send).
    pub fn recv(&self, buf: &mut [u8]) -> Result<()> {
        self.check_alive()?;
        if buf.len() < self.msg_size {
            return Err(Error::InvalidArgument("receive buffer shorter than msg_size"));
        }

        self.cons.down()?;
        self.mutex.down()?;
        {
            let mut ring = self.ring.borrow_mut();
            let at = ring.tail * self.msg_size;
            buf[..self.msg_size].copy_from_slice(&ring.buffer[at..at + self.msg_size]);
            ring.tail = (ring.tail + 1) % self.capacity;
            ring.length -= 1;
        }
        self.mutex.up()?;
        self.prod.up()
    }

    /// Messages currently queued.
    pub fn pending(&self) -> Result<usize> {
        self.check_alive()?;
        Ok(self.ring.borrow().length)
    }

    /// Destroy the queue and its semaphores. Blocked senders and receivers
    /// wake with [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        self.check_alive()?;
        self.destroyed.set(true);
        self.prod.destroy()?;
        self.cons.destroy()?;
        self.mutex.destroy()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.get() {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::rc::Rc;

    #[test]
    fn test_fifo_and_pending() {
        let kernel = Kernel::init(Config::virtual_clock()).unwrap();
        let queue = MessageQueue::new(&kernel, 4, 4).unwrap();
        for n in 0u32..3 {
            queue.send(&n.to_le_bytes()).unwrap();
        }
        assert_eq!(queue.pending(), Ok(3));

        let mut buf = [0u8; 4];
        for n in 0u32..3 {
            queue.recv(&mut buf).unwrap();
            assert_eq!(u32::from_le_bytes(buf), n);
        }
        assert_eq!(queue.pending(), Ok(0));
    }

    #[test]
    fn test_ring_wraps_around() {
        let kernel = Kernel::init(Config::virtual_clock()).unwrap();
        let queue = MessageQueue::new(&kernel, 2, 1).unwrap();
        let mut buf = [0u8; 1];
        for n in 0u8..7 {
            queue.send(&[n]).unwrap();
            queue.recv(&mut buf).unwrap();
            assert_eq!(buf[0], n);
        }
    }

    #[test]
    fn test_full_queue_blocks_sender() {
        let kernel = Kernel::init(Config::virtual_clock()).unwrap();
        let queue = Rc::new(MessageQueue::new(&kernel, 2, 1).unwrap());
        let producer = {
            let queue = Rc::clone(&queue);
            kernel
                .spawn(move |_| {
                    for n in 0u8..5 {
                        queue.send(&[n]).unwrap();
                    }
                    0
                })
                .unwrap()
        };

        kernel.yield_now();
        assert_eq!(queue.pending(), Ok(2), "producer stopped at capacity");

        let mut buf = [0u8; 1];
        for n in 0u8..5 {
            queue.recv(&mut buf).unwrap();
            assert_eq!(buf[0], n);
        }
        assert_eq!(kernel.join(producer), Ok(0));
        assert_eq!(queue.pending(), Ok(0));
    }

    #[test]
    fn test_bad_arguments() {
        let kernel = Kernel::init(Config::virtual_clock()).unwrap();
        assert!(matches!(MessageQueue::new(&kernel, 0, 4), Err(Error::InvalidArgument(_))));
        assert!(matches!(MessageQueue::new(&kernel, 4, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            MessageQueue::new(&kernel, usize::MAX / 2, 4),
            Err(Error::InvalidArgument(_)) | Err(Error::OutOfMemory)
        ));

        let queue = MessageQueue::new(&kernel, 1, 4).unwrap();
        assert!(matches!(queue.send(&[1, 2]), Err(Error::InvalidArgument(_))));
        let mut short = [0u8; 2];
        assert!(matches!(queue.recv(&mut short), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_destroy_wakes_blocked_receiver() {
        let kernel = Kernel::init(Config::virtual_clock()).unwrap();
        let queue = Rc::new(MessageQueue::new(&kernel, 1, 1).unwrap());
        let receiver = {
            let queue = Rc::clone(&queue);
            kernel
                .spawn(move |_| {
                    let mut buf = [0u8; 1];
                    match queue.recv(&mut buf) {
                        Err(Error::Destroyed) => 1,
                        _ => 0,
                    }
                })
                .unwrap()
        };
        kernel.yield_now();
        queue.destroy().unwrap();
        assert_eq!(kernel.join(receiver), Ok(1));
        assert_eq!(queue.pending(), Err(Error::Destroyed));
        assert_eq!(queue.send(&[0]), Err(Error::Destroyed));
    }
}
