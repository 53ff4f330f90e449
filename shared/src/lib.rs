pub mod flags;
pub mod protocol;
pub mod types;

pub use flags::{AddressStatus, EventKind, ServiceStatus};
pub use types::{AddressEntry, AddressFamily, ServiceEntry, TxtRecord, TxtValue};
