#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backoff;
pub mod hook;
mod key;
pub mod plan;
mod queue;

pub use self::{
    backoff::Backoff,
    hook::{HookRequest, HookResponse},
    key::ReconcileKey,
    plan::{AttachmentId, Owner, Plan},
    queue::WorkQueue,
};
