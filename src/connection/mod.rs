pub mod gatekeeper;
pub mod router;
pub mod subsystem;
pub mod supervisor;
pub mod transport;
