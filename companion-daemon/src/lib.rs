//! Liaison runtime: session actor, alarm multiplexing, event relay,
//! crash-storm guard, and the local control socket.

pub mod alarm;
mod error;
pub mod guard;
pub mod host;
pub mod paths;
pub mod privilege;
pub mod protocol;
pub mod relay;
pub mod remote;
mod runtime;
pub mod service;
pub mod session;

#[cfg(test)]
mod testing;

pub use alarm::{AlarmMultiplexer, ForwardOutcome, TokioAlarmFacility};
pub use error::CompanionError;
pub use guard::{CrashStormGuard, DumpReport, GuardOutcome};
pub use protocol::{
    request_broadcast, request_cancel_alarm, request_dump, request_ready, request_set_alarm,
    request_snapshot, request_status, request_stop, send_request, CompanionRequest,
    CompanionResponse,
};
pub use relay::RelayEvent;
pub use remote::{SocketDaemon, SocketLocator};
pub use runtime::{run, start_blocking};
pub use service::{CompanionService, Permission, PermissionChecker};
pub use session::{
    spawn_session, Collaborators, ReadyOutcome, RelayOutcome, Session, SessionHandle,
    SessionStatus, SnapshotOutcome,
};
