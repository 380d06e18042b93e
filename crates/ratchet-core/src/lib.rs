mod alarm;
mod config;
mod demux;
mod scheduler;
mod task;
mod wait;

pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
pub use task::{Scratch, TaskStatus};
pub use wait::TaskHandle;

pub use ratchet_types::{
    Direction, DnsAnswer, ErrorKind, MxRecord, PauseValue, QueryType, RatchetError, ResumeValue,
    TaskId, Waitable, WaitRecord, WaitRecordId, WaitRecordKind, YieldPayload, order_mx_records,
};
