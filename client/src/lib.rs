pub mod initiator;

pub use initiator::{Error, HandshakeInitiator, Mismatch};
