mod g_code;
mod grbl;
mod transport;

pub use g_code::*;
pub use grbl::*;
pub use transport::*;
