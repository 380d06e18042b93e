pub mod dns;
pub mod error;
pub mod ids;
pub mod waitable;
pub mod wait_record;
pub mod yield_payload;

pub use dns::{DnsAnswer, MxRecord, QueryType, order_mx_records};
pub use error::{ErrorKind, RatchetError};
pub use ids::{TaskId, WaitRecordId};
pub use waitable::Waitable;
pub use wait_record::{WaitRecord, WaitRecordKind};
pub use yield_payload::{Direction, PauseValue, ResumeValue, YieldPayload};
