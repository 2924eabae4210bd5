mod admission;
mod operations;
mod session;
mod types;


pub use admission::{Admission, AdmissionQueue};
pub use operations::IncomingSnapshot;
pub use session::{CallSession, CallTransition, InvalidTransition};
pub use types::{CallRole, CallStatus, EndReason};
