use std::fs;
use std::path::PathBuf;

use clap::Args;
use hvppman::{
    Chip, DEFAULT_BAUD_RATE, FuseKind, MemoryImage, MemoryKind, ProgrammerSession, Request,
    Response, SessionWorker,
    chips::{self, ChipProfile},
    error::{HvppError, HvppResult},
    interface, memory,
};
use tracing::info;

use crate::util::{create_progress_bar, format_signature, parse_hex_byte};

#[derive(Args, Debug, Clone)]
pub(crate) struct PortOptions {
    /// Serial port of the programmer
    #[clap(short, long)]
    port: String,

    /// Baud rate
    #[clap(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baudrate: u32,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct TargetOptions {
    /// Target chip
    #[clap(short, long)]
    chip: Chip,

    #[command(flatten)]
    port: PortOptions,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct WriteFuseOptions {
    #[command(flatten)]
    target: TargetOptions,

    /// Fuse byte to program
    #[clap(short, long)]
    kind: FuseKind,

    /// New value, hex (e.g. 0xE2)
    #[clap(value_parser = parse_hex_byte)]
    value: u8,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct WriteLockOptions {
    #[command(flatten)]
    target: TargetOptions,

    /// New lock byte, hex
    #[clap(value_parser = parse_hex_byte)]
    value: u8,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct EraseOptions {
    #[command(flatten)]
    target: TargetOptions,

    /// Confirm the erase of flash, EEPROM and lock bits
    #[clap(long, default_value_t = false)]
    yes: bool,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct MemoryOptions {
    #[command(flatten)]
    target: TargetOptions,

    /// Memory to access
    #[clap(short, long, value_enum, default_value_t = MemoryKind::Flash)]
    memory: MemoryKind,

    /// Intel HEX file
    #[clap(short, long)]
    file: PathBuf,
}

fn open_worker(target: &TargetOptions) -> HvppResult<SessionWorker> {
    let mut session = ProgrammerSession::new();
    session.select_chip(target.chip.profile());
    session.connect(&target.port.port, target.port.baudrate)?;
    if let Some(firmware) = session.firmware_info() {
        info!("Programmer firmware: {}", firmware);
    }
    Ok(SessionWorker::spawn(session))
}

fn run(target: &TargetOptions, request: Request) -> HvppResult<Response> {
    let worker = open_worker(target)?;
    worker.submit(request)?;
    worker.wait(|_, _| {})
}

fn run_with_progress(target: &TargetOptions, request: Request, msg: &str) -> HvppResult<Response> {
    let worker = open_worker(target)?;
    worker.submit(request)?;

    let pb = create_progress_bar(0, msg);
    let result = worker.wait(|done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    });
    if result.is_ok() {
        pb.finish();
    } else {
        pb.abandon();
    }
    result
}

fn unexpected(response: Response) -> HvppError {
    HvppError::FirmwareError(format!("Unexpected worker response {:?}", response))
}

pub(crate) fn list_chips() {
    for profile in chips::CHIP_PROFILES.iter() {
        let signatures = profile
            .signatures
            .iter()
            .map(format_signature)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<20} signature {:<20} flash {:>6} B  eeprom {:>5} B",
            profile.id, signatures, profile.flash.total_bytes, profile.eeprom.total_bytes
        );
    }
}

pub(crate) fn list_ports() -> HvppResult<()> {
    let ports = interface::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

pub(crate) fn read_signature(target: TargetOptions) -> HvppResult<()> {
    let profile = target.chip.profile();
    let signature = match run(&target, Request::ReadSignature)? {
        Response::Signature(signature) => signature,
        other => return Err(unexpected(other)),
    };

    println!("Signature: {}", format_signature(&signature));
    if profile.matches_signature(signature) {
        println!("Matches {}", profile.id);
    } else {
        let known = chips::CHIP_PROFILES
            .iter()
            .find(|chip| chip.matches_signature(signature))
            .map(|chip| chip.id)
            .unwrap_or("no known chip");
        println!("Does not match {} (looks like {})", profile.id, known);
    }
    Ok(())
}

fn print_fuse(name: &str, value: u8, layout: &chips::FuseLayout) {
    println!("{:<9} {:#04x}", name, value);
    for (bit, programmed) in layout.describe(value) {
        println!("    {:<10} {}", bit, if programmed { "programmed" } else { "-" });
    }
}

fn print_fuses(profile: &ChipProfile, fuses: &hvppman::FuseBytes) {
    print_fuse("low", fuses.low, &profile.low_fuse);
    print_fuse("high", fuses.high, &profile.high_fuse);
    if let Some(layout) = &profile.extended_fuse {
        print_fuse("extended", fuses.extended, layout);
    }
    print_fuse("lock", fuses.lock, &profile.lock);
}

pub(crate) fn read_fuses(target: TargetOptions) -> HvppResult<()> {
    let profile = target.chip.profile();
    match run(&target, Request::ReadFuses)? {
        Response::Fuses(fuses) => print_fuses(profile, &fuses),
        other => return Err(unexpected(other)),
    }
    Ok(())
}

pub(crate) fn write_fuse(opts: WriteFuseOptions) -> HvppResult<()> {
    // Reject before the port is even opened
    opts.target
        .chip
        .profile()
        .validate_fuse(opts.kind, opts.value)?;
    run(&opts.target, Request::WriteFuse(opts.kind, opts.value))?;
    println!("Wrote {} fuse {:#04x}", opts.kind, opts.value);
    Ok(())
}

pub(crate) fn write_lock(opts: WriteLockOptions) -> HvppResult<()> {
    opts.target.chip.profile().validate_lock(opts.value)?;
    run(&opts.target, Request::WriteLock(opts.value))?;
    println!("Wrote lock byte {:#04x}", opts.value);
    Ok(())
}

pub(crate) fn read_calibration(target: TargetOptions) -> HvppResult<()> {
    match run(&target, Request::ReadCalibration)? {
        Response::Byte(value) => println!("Calibration byte: {:#04x}", value),
        other => return Err(unexpected(other)),
    }
    Ok(())
}

pub(crate) fn erase(opts: EraseOptions) -> HvppResult<()> {
    if !opts.yes {
        println!("Chip erase clears flash, EEPROM and lock bits. Re-run with --yes to confirm.");
        return Ok(());
    }
    run(&opts.target, Request::Erase)?;
    println!("Chip erased");
    Ok(())
}

pub(crate) fn read_log(port: PortOptions) -> HvppResult<()> {
    let mut session = ProgrammerSession::new();
    session.connect(&port.port, port.baudrate)?;
    let worker = SessionWorker::spawn(session);
    worker.submit(Request::ReadLog)?;
    match worker.wait(|_, _| {})? {
        Response::Log(log) => println!("{}", log),
        other => return Err(unexpected(other)),
    }
    Ok(())
}

pub(crate) fn read_memory(opts: MemoryOptions) -> HvppResult<()> {
    let msg = format!("Reading {}", opts.memory.name());
    let data = match run_with_progress(&opts.target, Request::ReadMemory(opts.memory), &msg)? {
        Response::Memory(data) => data,
        other => return Err(unexpected(other)),
    };

    let hex = memory::to_intel_hex(&data)?;
    fs::write(&opts.file, hex).map_err(|e| {
        HvppError::FirmwareError(format!("Could not write {}: {}", opts.file.display(), e))
    })?;
    println!("Saved {} bytes to {}", data.len(), opts.file.display());
    Ok(())
}

pub(crate) fn write_memory(opts: MemoryOptions) -> HvppResult<()> {
    let content = fs::read_to_string(&opts.file).map_err(|e| {
        HvppError::FirmwareError(format!("Could not read {}: {}", opts.file.display(), e))
    })?;
    let image = MemoryImage::from_intel_hex(&content)?;
    let layout = opts.target.chip.profile().memory(opts.memory);
    image.check_fits(opts.memory, layout.total_bytes)?;

    let msg = format!("Writing {}", opts.memory.name());
    run_with_progress(&opts.target, Request::WriteMemory(opts.memory, image), &msg)?;
    println!("Wrote {} to {}", opts.file.display(), opts.memory.name());
    Ok(())
}
