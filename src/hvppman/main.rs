use clap::{Parser, command};
use commands::{
    EraseOptions, MemoryOptions, PortOptions, TargetOptions, WriteFuseOptions, WriteLockOptions,
};
use hvppman::error::HvppResult;

mod commands;
mod util;

#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
enum Cli {
    /// List supported chips
    Chips,

    /// List serial ports
    Ports,

    /// Read the device signature
    #[command(alias = "sig")]
    Signature(TargetOptions),

    /// Read fuse and lock bytes
    Fuses(TargetOptions),

    /// Program one fuse byte
    WriteFuse(WriteFuseOptions),

    /// Program the lock byte
    WriteLock(WriteLockOptions),

    /// Read the oscillator calibration byte
    Calibration(TargetOptions),

    /// Erase flash, EEPROM and lock bits
    Erase(EraseOptions),

    /// Print the programmer's diagnostic log
    Log(PortOptions),

    /// Read flash or EEPROM into an Intel HEX file
    Read(MemoryOptions),

    /// Program flash or EEPROM from an Intel HEX file
    Write(MemoryOptions),
}

fn main() -> HvppResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli {
        Cli::Chips => commands::list_chips(),
        Cli::Ports => commands::list_ports()?,
        Cli::Signature(opts) => commands::read_signature(opts)?,
        Cli::Fuses(opts) => commands::read_fuses(opts)?,
        Cli::WriteFuse(opts) => commands::write_fuse(opts)?,
        Cli::WriteLock(opts) => commands::write_lock(opts)?,
        Cli::Calibration(opts) => commands::read_calibration(opts)?,
        Cli::Erase(opts) => commands::erase(opts)?,
        Cli::Log(opts) => commands::read_log(opts)?,
        Cli::Read(opts) => commands::read_memory(opts)?,
        Cli::Write(opts) => commands::write_memory(opts)?,
    }

    Ok(())
}
