//! # Strand Demo
//!
//! Runs three scenarios on one kernel:
//!
//! | Scenario        | Tasks | Shows                                        |
//! |-----------------|-------|----------------------------------------------|
//! | `round_robin`   | 5     | FCFS order among equal priorities             |
//! | `prodcons`      | 5     | bounded message queue, blocking send / recv   |
//! | `contention`    | 8     | preemption inside a mutex-protected section   |
//!
//! Log verbosity comes from `STRAND_LOG` (`error` .. `trace`, default
//! `info`).

use std::io::Write;
use std::rc::Rc;

use log::{LevelFilter, Metadata, Record};

use strand::{Config, Kernel, MessageQueue, Mutex, TaskOptions};

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                std::io::stderr(),
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn install_logger() {
    let level = std::env::var("STRAND_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Five tasks of equal priority, each printing and yielding five times.
fn round_robin(kernel: &Kernel) -> strand::Result<()> {
    let mut tasks = Vec::new();
    for n in 0..5 {
        tasks.push(kernel.spawn(move |k| {
            for round in 0..5 {
                println!("round_robin: task {n} round {round}");
                k.yield_now();
            }
            n
        })?);
    }
    for id in tasks {
        let code = kernel.join(id)?;
        log::info!("round_robin: task {id} exited with {code}");
    }
    Ok(())
}

/// Three producers feed two consumers through a five-slot queue.
fn prodcons(kernel: &Kernel) -> strand::Result<()> {
    const ITEMS: u32 = 10;
    let queue = Rc::new(MessageQueue::new(kernel, 5, 4)?);
    let mut producers = Vec::new();

    for p in 0..3u32 {
        let queue = Rc::clone(&queue);
        producers.push(kernel.spawn(move |k| {
            for i in 0..ITEMS {
                let item = p * 100 + i;
                if queue.send(&item.to_le_bytes()).is_err() {
                    return 1;
                }
                k.sleep(u64::from(item % 7));
            }
            0
        })?);
    }

    let mut consumers = Vec::new();
    for c in 0..2 {
        let queue = Rc::clone(&queue);
        consumers.push(kernel.spawn(move |_| {
            let mut buf = [0u8; 4];
            let mut received = 0;
            while queue.recv(&mut buf).is_ok() {
                println!("prodcons: consumer {c} got {}", u32::from_le_bytes(buf));
                received += 1;
            }
            received
        })?);
    }

    for id in producers {
        kernel.join(id)?;
    }
    while queue.pending()? > 0 {
        kernel.yield_now();
    }
    queue.destroy()?;

    let mut total = 0;
    for id in consumers {
        total += kernel.join(id)?;
    }
    log::info!("prodcons: {total} items delivered");
    Ok(())
}

/// Compute-bound tasks incrementing a shared counter under a mutex. The
/// quota expires inside the critical section now and then.
fn contention(kernel: &Kernel) -> strand::Result<()> {
    const TASKS: i32 = 8;
    const ROUNDS: i32 = 2000;
    let counter = Rc::new(Mutex::new(kernel, 0i64));

    let mut tasks = Vec::new();
    for n in 0..TASKS {
        let counter = Rc::clone(&counter);
        let options = TaskOptions::default().priority(n % 3);
        tasks.push(kernel.spawn_with(options, move |k| {
            for _ in 0..ROUNDS {
                let Ok(mut value) = counter.lock() else {
                    return 1;
                };
                let seen = *value;
                k.preempt_check();
                *value = seen + 1;
            }
            0
        })?);
    }
    for id in tasks {
        kernel.join(id)?;
    }

    let total = *counter.lock()?;
    println!(
        "contention: counter = {total} (expected {})",
        i64::from(TASKS * ROUNDS)
    );
    Ok(())
}

fn main() {
    install_logger();

    let kernel = match Kernel::init(Config::default().with_tick_budget(2)) {
        Ok(kernel) => kernel,
        Err(err) => {
            log::error!("kernel init failed: {err}");
            std::process::exit(1);
        }
    };

    let scenarios: [(&str, fn(&Kernel) -> strand::Result<()>); 3] = [
        ("round_robin", round_robin),
        ("prodcons", prodcons),
        ("contention", contention),
    ];
    for (name, scenario) in scenarios {
        if let Err(err) = scenario(&kernel) {
            log::error!("{name} failed: {err}");
        }
    }

    if let Ok(stats) = kernel.stats(kernel.id()) {
        log::debug!("main: {} activations, {} cpu ticks", stats.activations, stats.cpu_ticks);
    }
    kernel.exit(0);
}
