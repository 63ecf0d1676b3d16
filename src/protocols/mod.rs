pub mod hvpp;

pub use hvpp::{CommandFrame, FuseBytes, HvppCommand, ResponseFrame};
