pub mod session;
pub mod wire;

/// Port the server binary listens on and the client binary dials by default.
pub const PORT: u16 = 9000;
