//! Vireo VMM launcher
//!
//! Builds a motherboard, creates the devices named on the command line and
//! runs a short disk check against every host disk. Storage is a host-memory
//! backend so the launcher runs without hardware.
//!
//! Usage:
//!   vrt-vmm hostdisk:0 hostdisk:1,0
//!   vrt-vmm --list

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use vrt_hw::DmaRegion;
use vrt_storage::{CompletionStatus, Controller, MemoryDisk};
use vrt_vmm::message::{DiskStatus, MessageDisk, MessageDiskCommit};
use vrt_vmm::{DeviceRegistry, HostDisks, Motherboard};

const SECTOR_SIZE: usize = 512;

#[derive(Parser, Debug)]
#[command(name = "vrt-vmm")]
#[command(about = "Vireo virtual machine monitor device model")]
struct Args {
    /// List the devices the command line can create and exit
    #[arg(long)]
    list: bool,

    /// Size of the host-memory disk in sectors
    #[arg(long, default_value_t = 2048)]
    disk_sectors: u64,

    /// Boot command line, e.g. `hostdisk:0`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmdline: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.disk_sectors == 0 {
        bail!("--disk-sectors must be at least 1");
    }

    let memdisk = MemoryDisk::new(args.disk_sectors, SECTOR_SIZE)
        .context("Cannot create the host-memory disk")?;
    let backend: Arc<dyn Controller> = Arc::new(memdisk);
    let mut registry = DeviceRegistry::new();
    let disks = HostDisks::register(&mut registry, backend)?;

    if args.list {
        for (name, help) in registry.devices() {
            println!("{:<12} {}", name, help);
        }
        return Ok(());
    }

    let cmdline = args.cmdline.join(" ");
    log::info!("Vireo VMM");
    log::info!("  Command line: {:?}", cmdline);

    let mb = Motherboard::new();
    let report = mb.parse_args(&registry, &cmdline);
    log::info!(
        "  Devices: {} created, {} ignored, {} failed",
        report.created.len(),
        report.ignored.len(),
        report.failed.len()
    );

    let commits = Rc::new(RefCell::new(Vec::new()));
    {
        let commits = Rc::clone(&commits);
        mb.bus_diskcommit().subscribe_fn(move |msg: &mut MessageDiskCommit| {
            commits.borrow_mut().push(*msg);
            true
        });
    }

    for disk in disks.numbers() {
        check_disk(&mb, &disks, disk, &commits)
            .with_context(|| format!("Disk {} check failed", disk))?;
    }

    if !report.failed.is_empty() {
        bail!("{} device(s) failed to start", report.failed.len());
    }
    Ok(())
}

/// Write a pattern to the last sector of `disk`, read it back and compare
fn check_disk(
    mb: &Motherboard,
    disks: &HostDisks,
    disk: u64,
    commits: &RefCell<Vec<MessageDiskCommit>>,
) -> Result<()> {
    let mut msg = MessageDisk::get_params(disk);
    if !mb.bus_disk().publish(&mut msg) {
        bail!("nobody answers for disk {}", disk);
    }
    let params = msg.params.context("no parameters")?;
    log::info!(
        "disk {}: '{}', {} sectors of {} bytes",
        disk,
        params.name,
        params.sectors,
        params.sector_size
    );

    let buffer = Arc::new(DmaRegion::allocate(2 * params.sector_size, 4096)?);
    let pattern: Vec<u8> = (0..params.sector_size).map(|i| (i % 251) as u8).collect();
    buffer.write(0, &pattern)?;
    let last = params.sectors - 1;

    let requests = [
        MessageDisk::write(disk, 1, last, 1, Arc::clone(&buffer), 0),
        MessageDisk::flush(disk, 2),
        MessageDisk::read(disk, 3, last, 1, Arc::clone(&buffer), params.sector_size),
    ];
    for mut request in requests {
        mb.bus_disk().publish(&mut request);
        if request.status != DiskStatus::Ok {
            bail!("{:?} rejected: {:?}", request.op, request.status);
        }
    }

    disks.commit_pending(mb);
    let committed = commits.borrow_mut().drain(..).collect::<Vec<_>>();
    for tag in 1..=3 {
        match committed.iter().find(|c| c.disk == disk && c.usertag == tag) {
            Some(commit) if commit.status == CompletionStatus::Success => {}
            Some(commit) => bail!("tag {} failed: {:?}", tag, commit.status),
            None => bail!("tag {} never completed", tag),
        }
    }

    let mut readback = vec![0; params.sector_size];
    buffer.read(params.sector_size, &mut readback)?;
    if readback != pattern {
        bail!("sector {} reads back different data", last);
    }
    log::info!("disk {}: write/flush/read of sector {} ok", disk, last);
    Ok(())
}
