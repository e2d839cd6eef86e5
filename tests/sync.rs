//! Synchronization primitives driven by real task interleavings.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use strand::{Barrier, Config, Error, Kernel, MessageQueue, Mutex, Semaphore, TaskOptions};

#[test]
fn test_semaphore_mutual_exclusion_under_preemption() {
    const TASKS: usize = 30;
    const ROUNDS: u64 = 500;

    let kernel = Kernel::init(Config::default().with_tick_budget(1)).unwrap();
    let sem = Rc::new(Semaphore::new(&kernel, 1));
    let counter = Rc::new(Cell::new(0u64));
    let inside = Rc::new(Cell::new(0u32));
    let overlaps = Rc::new(Cell::new(0u32));

    let mut ids = Vec::new();
    for _ in 0..TASKS {
        let (sem, counter) = (Rc::clone(&sem), Rc::clone(&counter));
        let (inside, overlaps) = (Rc::clone(&inside), Rc::clone(&overlaps));
        ids.push(
            kernel
                .spawn(move |k| {
                    for _ in 0..ROUNDS {
                        if sem.down().is_err() {
                            return 1;
                        }
                        inside.set(inside.get() + 1);
                        if inside.get() > 1 {
                            overlaps.set(overlaps.get() + 1);
                        }
                        let seen = counter.get();
                        k.preempt_check();
                        counter.set(seen + 1);
                        inside.set(inside.get() - 1);
                        if sem.up().is_err() {
                            return 1;
                        }
                    }
                    0
                })
                .unwrap(),
        );
    }
    for id in ids {
        assert_eq!(kernel.join(id), Ok(0));
    }

    assert_eq!(counter.get(), TASKS as u64 * ROUNDS);
    assert_eq!(overlaps.get(), 0);
    assert_eq!(sem.value(), 1, "no task left blocked");
}

#[test]
fn test_preemption_inside_critical_section_is_deterministic() {
    let kernel = Kernel::init(Config::virtual_clock().with_tick_budget(3)).unwrap();
    let sem = Rc::new(Semaphore::new(&kernel, 1));
    let trace = Rc::new(RefCell::new(Vec::new()));

    let mut ids = Vec::new();
    for n in 0..2 {
        let sem = Rc::clone(&sem);
        let trace = Rc::clone(&trace);
        ids.push(
            kernel
                .spawn(move |k| {
                    sem.down().unwrap();
                    trace.borrow_mut().push((n, "enter"));
                    // Exhaust the quota while holding the semaphore.
                    k.advance(3);
                    k.preempt_check();
                    trace.borrow_mut().push((n, "leave"));
                    sem.up().unwrap();
                    0
                })
                .unwrap(),
        );
    }
    for id in ids {
        kernel.join(id).unwrap();
    }

    assert_eq!(
        *trace.borrow(),
        vec![(0, "enter"), (0, "leave"), (1, "enter"), (1, "leave")]
    );
}

#[test]
fn test_mutex_protects_value() {
    let kernel = Kernel::init(Config::default().with_tick_budget(1)).unwrap();
    let total = Rc::new(Mutex::new(&kernel, 0u64));
    let mut ids = Vec::new();
    for n in 0..10 {
        let total = Rc::clone(&total);
        ids.push(
            kernel
                .spawn_with(TaskOptions::default().priority(n % 4), move |k| {
                    for _ in 0..200 {
                        let Ok(mut guard) = total.lock() else {
                            return 1;
                        };
                        let seen = *guard;
                        k.preempt_check();
                        *guard = seen + 1;
                    }
                    0
                })
                .unwrap(),
        );
    }
    for id in ids {
        assert_eq!(kernel.join(id), Ok(0));
    }
    assert_eq!(*total.lock().unwrap(), 2000);
}

#[test]
fn test_barrier_releases_exactly_at_last_arrival() {
    const PARTIES: usize = 5;
    let kernel = Kernel::init(Config::virtual_clock()).unwrap();
    let barrier = Rc::new(Barrier::new(&kernel, PARTIES).unwrap());
    let arrived = Rc::new(Cell::new(0usize));
    let seen_at_release = Rc::new(RefCell::new(Vec::new()));

    let mut ids = Vec::new();
    for n in 0..PARTIES {
        let barrier = Rc::clone(&barrier);
        let arrived = Rc::clone(&arrived);
        let seen = Rc::clone(&seen_at_release);
        ids.push(
            kernel
                .spawn(move |k| {
                    k.sleep(10 * n as u64);
                    arrived.set(arrived.get() + 1);
                    barrier.join().unwrap();
                    seen.borrow_mut().push(arrived.get());
                    0
                })
                .unwrap(),
        );
    }
    for id in ids {
        kernel.join(id).unwrap();
    }

    assert_eq!(*seen_at_release.borrow(), vec![PARTIES; PARTIES]);
    assert!(kernel.systime() >= 40);
    assert_eq!(barrier.join(), Err(Error::Spent));
}

#[test]
fn test_message_queue_many_producers_and_consumers() {
    const PRODUCERS: u32 = 3;
    const ITEMS: u32 = 20;

    let kernel = Kernel::init(Config::virtual_clock()).unwrap();
    let queue = Rc::new(MessageQueue::new(&kernel, 3, 4).unwrap());
    let received = Rc::new(RefCell::new(Vec::new()));

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let queue = Rc::clone(&queue);
        producers.push(
            kernel
                .spawn(move |k| {
                    for i in 0..ITEMS {
                        queue.send(&(p * 1000 + i).to_le_bytes()).unwrap();
                        if i % 3 == p {
                            k.yield_now();
                        }
                    }
                    0
                })
                .unwrap(),
        );
    }
    let mut consumers = Vec::new();
    for _ in 0..2 {
        let queue = Rc::clone(&queue);
        let received = Rc::clone(&received);
        consumers.push(
            kernel
                .spawn(move |_| {
                    let mut buf = [0u8; 4];
                    while queue.recv(&mut buf).is_ok() {
                        received.borrow_mut().push(u32::from_le_bytes(buf));
                    }
                    0
                })
                .unwrap(),
        );
    }

    for id in producers {
        kernel.join(id).unwrap();
    }
    while queue.pending().unwrap() > 0 {
        kernel.yield_now();
    }
    queue.destroy().unwrap();
    for id in consumers {
        kernel.join(id).unwrap();
    }

    let received = received.borrow();
    assert_eq!(received.len(), (PRODUCERS * ITEMS) as usize);
    for p in 0..PRODUCERS {
        let from_p: Vec<u32> = received
            .iter()
            .copied()
            .filter(|v| v / 1000 == p)
            .collect();
        let expected: Vec<u32> = (0..ITEMS).map(|i| p * 1000 + i).collect();
        assert_eq!(from_p, expected, "per-producer order is preserved");
    }
}

#[test]
fn test_message_queue_blocks_receiver_until_send() {
    let kernel = Kernel::init(Config::virtual_clock()).unwrap();
    let queue = Rc::new(MessageQueue::new(&kernel, 2, 2).unwrap());
    let got = Rc::new(RefCell::new(None));

    let receiver = {
        let queue = Rc::clone(&queue);
        let got = Rc::clone(&got);
        kernel
            .spawn(move |_| {
                let mut buf = [0u8; 2];
                queue.recv(&mut buf).unwrap();
                *got.borrow_mut() = Some(buf);
                0
            })
            .unwrap()
    };

    kernel.yield_now();
    assert_eq!(*got.borrow(), None, "receiver is blocked on an empty queue");

    queue.send(&[4, 2]).unwrap();
    assert_eq!(kernel.join(receiver), Ok(0));
    assert_eq!(*got.borrow(), Some([4, 2]));
    assert_eq!(queue.pending(), Ok(0));
}
