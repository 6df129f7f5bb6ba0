pub mod coordination;
pub mod identity;
pub mod registration;
pub mod relabel;
pub mod role;
pub mod settings;
pub mod status;
pub mod trace;
pub mod workload;

pub use vigil_macros::test;
