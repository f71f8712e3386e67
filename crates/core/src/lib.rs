//! Shared domain vocabulary and the push-frame wire format.

pub mod identity;
pub mod planning;
pub mod push;

pub use identity::UserRole;
pub use push::PushFrame;
