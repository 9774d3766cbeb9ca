//! Vireo timer daemon
//!
//! Hosts the timer service with one worker per CPU. Without an IPC
//! transport attached it can exercise itself: every worker opens the
//! client's wake handles, programs a deadline on its own CPU and waits for it.
//!
//! Usage:
//!   vrt-timerd --cpus 4 --demo-deadline-ms 10

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use vrt_base::{clock, cpu, CpuSet};
use vrt_ipc::{Request, Service, Status};
use vrt_timer::{opcode, TimerConfig, TimerPortal, DEFAULT_FREQUENCY};

#[derive(Parser, Debug)]
#[command(name = "vrt-timerd")]
#[command(about = "Per-CPU timer service for the Vireo runtime")]
struct Args {
    /// Number of CPUs to serve (default: available parallelism)
    #[arg(long)]
    cpus: Option<usize>,

    /// Ticks per second of deadlines and reported times
    #[arg(long, default_value_t = DEFAULT_FREQUENCY)]
    frequency: u64,

    /// Program and wait for a deadline this far in the future on every CPU
    #[arg(long)]
    demo_deadline_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cpus = match args.cpus {
        Some(0) => bail!("--cpus must be at least 1"),
        Some(n) => CpuSet::new(n),
        None => CpuSet::host(),
    };
    if args.frequency == 0 {
        bail!("--frequency must be non-zero");
    }

    log::info!("Vireo timer daemon");
    log::info!("  CPUs:      {}", cpus.count());
    log::info!("  Frequency: {} Hz", args.frequency);

    let config = TimerConfig {
        cpus,
        frequency: args.frequency,
    };
    let portal = TimerPortal::new(&config).context("Failed to start host timer")?;
    let service = Arc::new(Service::new("timer", cpus, portal));

    let Some(delay_ms) = args.demo_deadline_ms else {
        let reply = on_cpu(&service, 0, Request::new(opcode::GET_TIME));
        log::info!("Uptime {:?} ticks, wall clock {:?} us", reply.first(), reply.get(1));
        return Ok(());
    };

    let session = service
        .open_session("vrt-timerd self-test")
        .context("Failed to open session")?;

    let workers: Vec<_> = cpus
        .iter()
        .map(|id| {
            let service = Arc::clone(&service);
            thread::Builder::new()
                .name(format!("timer-worker{}", id))
                .spawn(move || self_test(&service, session, id, delay_ms))
                .context("Failed to spawn worker")
        })
        .collect::<Result<_>>()?;

    let mut failed = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("{:#}", err);
                failed += 1;
            }
            Err(_) => {
                log::error!("worker panicked");
                failed += 1;
            }
        }
    }
    service.close_session(session)?;

    if failed > 0 {
        bail!("{} of {} CPUs failed the self-test", failed, cpus.count());
    }
    log::info!("Self-test passed on {} CPU(s)", cpus.count());
    Ok(())
}

type TimerService = Service<TimerPortal>;

/// Run one request of the daemon's own session on `id`
fn on_cpu(service: &TimerService, id: usize, request: Request) -> Vec<u64> {
    let Ok(session) = service.open_session("vrt-timerd") else {
        return Vec::new();
    };
    cpu::bind(id);
    let reply = service.call(session, request);
    let _ = service.close_session(session);
    cpu::unbind();
    reply.words().to_vec()
}

fn self_test(service: &TimerService, session: usize, id: usize, delay_ms: u64) -> Result<()> {
    cpu::bind(id);

    let reply = service.call(session, Request::new(opcode::GET_WAKE_HANDLES));
    if reply.status() != Status::Success {
        bail!("CPU{}: GET_WAKE_HANDLES failed: {}", id, reply.status());
    }
    let wake = reply
        .handles()
        .get(id)
        .cloned()
        .with_context(|| format!("CPU{}: no wake handle", id))?;

    let frequency = service.portal().timer().clock().frequency();
    let before = service.portal().uptime();
    let deadline = before + clock::convert(delay_ms, 1_000, frequency);
    let started = Instant::now();
    let reply = service.call(session, Request::new(opcode::PROGRAM_TIMER).arg(deadline));
    if reply.status() != Status::Success {
        bail!("CPU{}: PROGRAM_TIMER failed: {}", id, reply.status());
    }

    if !wake.wait_timeout(Duration::from_millis(delay_ms) + Duration::from_secs(1)) {
        bail!("CPU{}: deadline of {} ms never fired", id, delay_ms);
    }
    let after = service.portal().uptime();
    log::info!(
        "CPU{}: woke after {:?} (uptime {} -> {})",
        id,
        started.elapsed(),
        before,
        after
    );
    if after < deadline {
        bail!("CPU{}: woke before the deadline", id);
    }
    Ok(())
}
