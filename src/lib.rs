//! Configure AVR microcontrollers through a serial attached high-voltage
//! parallel programmer (HVPP).
//!
//! ```no_run
//! use hvppman::{Chip, ProgrammerSession, DEFAULT_BAUD_RATE};
//!
//! let mut session = ProgrammerSession::new();
//! session.select_chip(Chip::Atmega328.profile());
//! session.connect("/dev/ttyUSB0", DEFAULT_BAUD_RATE)?;
//! let signature = session.verify_signature()?;
//! println!("{:02X?}", signature);
//! # Ok::<(), hvppman::error::HvppError>(())
//! ```

pub use chips::{Chip, ChipProfile, FuseKind, MemoryKind};
pub use constants::DEFAULT_BAUD_RATE;
pub use memory::MemoryImage;
pub use protocols::FuseBytes;
pub use session::{ConnectionState, OperationObserver, ProgrammerSession, SessionOptions};
pub use worker::{Request, Response, SessionWorker, WorkerEvent};

pub mod chips;
pub(crate) mod constants;
pub mod error;
pub mod interface;
pub mod memory;
pub mod protocols;
pub mod session;
pub mod worker;
