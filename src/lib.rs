pub mod clamav;
pub mod config;
pub mod error;
pub mod failover;
pub mod milter;
pub mod net;
pub mod scanner;
pub mod spamd;
pub mod upstream;
pub mod verdict;

pub use config::Config;
pub use error::{ScanError, ScanResult};
pub use milter::Milter;
pub use scanner::{MessageReport, ScanRequest, Scanner};
