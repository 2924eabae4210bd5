mod operations;
mod participant;
mod state;
mod types;


pub use participant::{Participant, ParticipantRoster};
pub use state::GroupCallSession;
pub use types::{GroupCallStatus, GroupCallTransition};
