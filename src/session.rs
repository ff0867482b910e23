pub mod delivery;
pub mod state;

pub use delivery::{
    DeliveryState, DeliveryTracker, Direction, InFlightMessage, InboundAction, PubRecOutcome,
    PubRelOutcome,
};
pub use state::{
    ConnAckOutcome, ConnectionContext, ConnectionState, KeepAliveAction, SessionStateMachine,
};
