//! Participant flows over the multisig, relay and token layers

pub mod toolkit;

pub use toolkit::{
    CoordinatorError, FanOutFailure, FanOutReport, FinishReport, Message, Proposal, SignOutcome,
    Toolkit, UpdateData, UpdatePublication, SIGNING_REQUEST_SUBJECT, UPDATE_APP_ID,
};
