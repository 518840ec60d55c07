mod machine;

pub use machine::{Machine, MachineKind, MachineStatus, OperationalStatus};
