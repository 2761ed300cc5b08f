//! RayOS Dataflow CLI
//!
//! Runs the reference programs against the scheduler: a parallel matrix
//! addition and two producer/consumer pipe relays.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use crossbeam::utils::Backoff;
use rayos_dataflow::{AccessMode, AccessTarget, Buffer, Pipe, Queue, RuntimeConfig, Scheduler};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "rayos-dataflow")]
#[command(about = "RayOS Dataflow - Accessor-Driven Kernel Scheduling", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log kernel start/stop at info level
    #[arg(long)]
    trace_kernels: bool,

    /// Maximum number of work items running at once (0 = unbounded)
    #[arg(short = 'm', long)]
    max_running: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise two matrices, add them, check the result on the host
    MatrixAdd {
        #[arg(long, default_value = "200")]
        rows: usize,

        #[arg(long, default_value = "300")]
        cols: usize,
    },

    /// Non-blocking producer and consumer on two queues released in order;
    /// the consumer adds the streamed values to a second vector
    PipeRelay {
        /// Pipe capacity; must hold the whole stream
        #[arg(long, default_value = "3")]
        capacity: usize,

        /// Values streamed through the pipe
        #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
        a: Vec<f32>,

        /// Values added on the consumer side
        #[arg(long, value_delimiter = ',', default_value = "5,6,8")]
        b: Vec<f32>,
    },

    /// Blocking producer and consumer sharing one queue
    PipeRendezvous {
        #[arg(long, default_value = "2")]
        capacity: usize,

        /// Elements to send
        #[arg(long, default_value = "3")]
        count: usize,
    },

    /// Run every program and show scheduler statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = cli.config {
        RuntimeConfig::load(config_path)?
    } else {
        RuntimeConfig::default()
    };

    // Override with CLI options
    if cli.trace_kernels {
        config.trace_kernels = true;
    }
    if let Some(max_running) = cli.max_running {
        config.max_running_items = max_running;
    }

    let scheduler = Scheduler::new(config);

    match cli.command {
        Commands::MatrixAdd { rows, cols } => {
            let start = Instant::now();
            matrix_add(&scheduler, rows, cols)?;
            println!(
                "✓ Good computation! ({}x{} in {:.2}ms)",
                rows,
                cols,
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
        Commands::PipeRelay { capacity, a, b } => {
            let result = pipe_relay(&scheduler, capacity, &a, &b)?;
            let line: Vec<String> = result.iter().map(|v| v.to_string()).collect();
            println!("Result:");
            println!("{}", line.join(" "));
        }
        Commands::PipeRendezvous { capacity, count } => {
            let received = pipe_rendezvous(&scheduler, capacity, count)?;
            println!("Received: {:?}", received);
        }
        Commands::Stats => {
            matrix_add(&scheduler, 20, 30)?;
            pipe_relay(&scheduler, 3, &[1.0, 2.0, 3.0], &[5.0, 6.0, 8.0])?;
            pipe_rendezvous(&scheduler, 2, 3)?;

            let stats = scheduler.statistics();
            println!("\n=== Scheduler ===");
            println!("Total work items: {}", stats.total_items);
            println!("Completed: {}", stats.completed_items);
            println!("Failed: {}", stats.failed_items);
            println!("Pending: {}", stats.pending_items);
            println!("Running: {}", stats.running_items);
            println!("Tracked resources: {}", stats.tracked_resources);
        }
    }

    Ok(())
}

fn matrix_add(scheduler: &Scheduler, rows: usize, cols: usize) -> Result<()> {
    let extent = [rows, cols];
    let a: Buffer<f64> = Buffer::new(scheduler, &extent);
    let b: Buffer<f64> = Buffer::new(scheduler, &extent);
    let c: Buffer<f64> = Buffer::new(scheduler, &extent);

    let queue = Queue::new(scheduler);

    queue.submit(|cgh| {
        let a = a.access(cgh, AccessMode::Write)?;
        cgh.parallel_for("init_a", &extent, move |i| {
            a.set(i, (i[0] * 2 + i[1]) as f64)?;
            Ok(())
        });
        Ok(())
    })?;

    // Independent of init_a, may run alongside it
    queue.submit(|cgh| {
        let b = b.access(cgh, AccessMode::Write)?;
        cgh.parallel_for("init_b", &extent, move |i| {
            b.set(i, (i[0] * 2014 + i[1] * 42) as f64)?;
            Ok(())
        });
        Ok(())
    })?;

    queue.submit(|cgh| {
        let a = a.access(cgh, AccessMode::Read)?;
        let b = b.access(cgh, AccessMode::Read)?;
        let c = c.access(cgh, AccessMode::Write)?;
        cgh.parallel_for("matrix_add", &extent, move |i| {
            c.set(i, a.get(i)? + b.get(i)?)?;
            Ok(())
        });
        Ok(())
    })?;

    // Waits for matrix_add only
    let result = c.host_access(AccessMode::Read)?;
    for i in 0..rows {
        for j in 0..cols {
            let value = result.get(&[i, j])?;
            let expected = (i * (2 + 2014) + j * (1 + 42)) as f64;
            if value != expected {
                bail!("Wrong value {} on element {} {}", value, i, j);
            }
        }
    }
    drop(result);

    queue.release()?;
    Ok(())
}

/// Producer streams `a` through the pipe without blocking; a consumer on a
/// second queue, started only once the first has drained, adds `b` to it
fn pipe_relay(
    scheduler: &Scheduler,
    capacity: usize,
    a: &[f32],
    b: &[f32],
) -> Result<Vec<f32>> {
    if a.len() != b.len() {
        bail!("input vectors differ in length ({} vs {})", a.len(), b.len());
    }
    // The producer's queue drains before the consumer starts
    if capacity < a.len() {
        bail!(
            "pipe capacity {} cannot hold {} elements: the producer would never finish",
            capacity,
            a.len()
        );
    }

    let n = a.len();
    let a = Buffer::from_vec(scheduler, &[n], a.to_vec())?;
    let b = Buffer::from_vec(scheduler, &[n], b.to_vec())?;
    let c: Buffer<f32> = Buffer::new(scheduler, &[n]);
    let pipe: Pipe<f32> = Pipe::new(scheduler, capacity);

    {
        let producer = Queue::new(scheduler);
        producer.submit(|cgh| {
            let tx = pipe.writer(cgh, AccessTarget::PipeNonBlocking)?;
            let ka = a.access(cgh, AccessMode::Read)?;
            cgh.single_task("producer", move || {
                for i in 0..n {
                    let v = ka.get(&[i])?;
                    let backoff = Backoff::new();
                    while !tx.write(v) {
                        backoff.snooze();
                    }
                }
                Ok(())
            });
            Ok(())
        })?;
        producer.release()?;
    }

    let consumer = Queue::new(scheduler);
    consumer.submit(|cgh| {
        let rx = pipe.reader(cgh, AccessTarget::PipeNonBlocking)?;
        let kb = b.access(cgh, AccessMode::Read)?;
        let kc = c.access(cgh, AccessMode::Write)?;
        cgh.single_task("consumer", move || {
            for i in 0..n {
                let backoff = Backoff::new();
                let e = loop {
                    if let Some(v) = rx.read() {
                        break v;
                    }
                    backoff.snooze();
                };
                kc.set(&[i], e + kb.get(&[i])?)?;
            }
            Ok(())
        });
        Ok(())
    })?;
    consumer.release()?;

    pipe.release()?;
    let result = c.host_access(AccessMode::Read)?.to_vec()?;
    c.release()?;
    Ok(result)
}

/// Blocking producer and consumer in one queue, sending `count` values
/// through a pipe of `capacity`
fn pipe_rendezvous(scheduler: &Scheduler, capacity: usize, count: usize) -> Result<Vec<i32>> {
    if capacity == 0 {
        bail!("pipe capacity must be at least 1");
    }

    let pipe: Pipe<i32> = Pipe::new(scheduler, capacity);
    let out: Buffer<i32> = Buffer::new(scheduler, &[count]);
    let queue = Queue::new(scheduler);

    queue.submit(|cgh| {
        let tx = pipe.writer(cgh, AccessTarget::PipeBlocking)?;
        cgh.single_task("producer", move || {
            for v in 0..count as i32 {
                tx.write(v);
            }
            Ok(())
        });
        Ok(())
    })?;

    queue.submit(|cgh| {
        let rx = pipe.reader(cgh, AccessTarget::PipeBlocking)?;
        let out = out.access(cgh, AccessMode::DiscardWrite)?;
        cgh.single_task("consumer", move || {
            for i in 0..count {
                if let Some(v) = rx.read() {
                    out.set(&[i], v)?;
                }
            }
            Ok(())
        });
        Ok(())
    })?;

    queue.release()?;
    pipe.release()?;

    let received = out.host_access(AccessMode::Read)?.to_vec()?;
    out.release()?;
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_relay_adds_streams() {
        let scheduler = Scheduler::default();
        let result = pipe_relay(&scheduler, 3, &[1.0, 2.0, 3.0], &[5.0, 6.0, 8.0]).unwrap();
        assert_eq!(result, vec![6.0, 8.0, 11.0]);
        assert_eq!(scheduler.statistics().failed_items, 0);
    }

    #[test]
    fn test_pipe_relay_rejects_short_capacity() {
        let scheduler = Scheduler::default();
        assert!(pipe_relay(&scheduler, 2, &[1.0, 2.0, 3.0], &[5.0, 6.0, 8.0]).is_err());
        assert!(pipe_relay(&scheduler, 3, &[1.0, 2.0], &[5.0]).is_err());
        assert_eq!(scheduler.statistics().total_items, 0);
    }

    #[test]
    fn test_pipe_rendezvous_preserves_order() {
        let scheduler = Scheduler::default();
        assert_eq!(pipe_rendezvous(&scheduler, 2, 5).unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
