pub mod binder;
pub mod credentials;
pub mod ident;
pub mod protocol;
pub mod server;
pub mod session;
pub mod wire;
