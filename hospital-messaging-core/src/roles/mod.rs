// hospital-messaging-core/src/roles/mod.rs
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub mod admin;
pub mod medic;
pub mod specialist;
pub mod worker;

pub use admin::Administrator;
pub use medic::{parse_request_line, Medic, MedicEvent, MedicOptions};
pub use specialist::{QueueSharing, Specialist, SpecialistEvent, SpecialistOptions};
pub use worker::{HospitalWorker, LogNotifier};

/// Events a role holds for a front end that is not reading them. Past this
/// they are dropped with a warning.
pub const EVENT_BUFFER: usize = 1024;

pub(crate) fn forward<T>(tx: &mpsc::Sender<T>, event: T, stream: &'static str) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(stream, capacity = EVENT_BUFFER, "event receiver lagging, event dropped")
        }
        Err(TrySendError::Closed(_)) => debug!(stream, "event receiver dropped"),
    }
}
