// record-pipeline-rs/src/lib.rs
//
// The custody core's orchestration crate: the record pipeline (create, read,
// version, grant, revoke, archive, verify) and the ledger event fan-out.
// The HTTP surface in front of this crate is an external collaborator.

pub mod fanout;
pub mod pipeline;

pub use fanout::{
    EventFanout, EventHandler, Notifier, PermissionProjector, PolicyCacheInvalidator,
    UserNotification,
};
pub use pipeline::{CreateRecordRequest, ReadOutcome, RecordService, RequestContext};
