mod create;
mod delete;
mod kill;
mod start;
mod state;

pub use create::{run_create, CreateArgs};
pub use delete::{run_delete, DeleteArgs};
pub use kill::{run_kill, KillArgs};
pub use start::{run_start, StartArgs};
pub use state::{run_state, StateArgs};
