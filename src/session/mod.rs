pub mod registry;

pub use registry::{InvalidationReason, Session, SessionError, SessionRegistry};
