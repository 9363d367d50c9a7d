mod error;
mod logger;

pub use error::PlumeError;
pub use logger::setup_logging;
