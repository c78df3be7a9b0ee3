pub mod cgm;
pub mod command;
pub mod companion;
pub mod config;
pub mod crc;
pub mod encoding;
pub mod error;
pub mod history;
pub mod hw;
pub mod packet;
pub mod page;
pub mod radio;
pub mod response;
pub mod schedule;
pub mod session;
pub mod time;
pub mod tune;
pub mod units;

// Re-export the main entry points for easy access
pub use command::{DeviceId, Opcode};
pub use config::SessionConfig;
pub use error::{MdtError, PartialDecode};
pub use radio::RadioOps;
pub use radio::cc1101::Cc1101;
pub use radio::rfm69::Rfm69;
pub use session::Session;
pub use units::{Family, Insulin};
