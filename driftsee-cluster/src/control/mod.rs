pub mod correlator;
pub mod error;

pub use correlator::{ControlCorrelator, CorrelatorOptions};
pub use error::{ControlError, ControlResult};
