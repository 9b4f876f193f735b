// Node module: who this machine is on the bus.

pub mod identity;

pub use identity::{IdentitySource, MachineIdentity};
