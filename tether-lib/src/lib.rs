pub mod address;
pub mod controller;
pub mod data_session;
pub mod negotiation;
pub mod relay;
pub mod signaling;
pub mod transport;

pub use address::{resolve, Resolution, Role, RoomKey, ValidationError, ValidationErrorKind};
pub use controller::{
    CommandError, ControllerConfig, ControllerHandle, SessionController, SessionEvent,
};
pub use negotiation::{EndReason, SessionState};
