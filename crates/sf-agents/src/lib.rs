pub mod adapter;
pub mod state_machine;
pub mod supervisor;
