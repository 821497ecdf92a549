//! Operating-system helpers: pid files, signals and named pipes.
//!
//! Everything that talks to the OS directly through `nix` lives here, so the
//! rest of the crate only deals with paths and `Result`s.

pub mod fifo;
pub mod process;

pub use fifo::ensure_fifo;
pub use process::{
    is_process_alive, probe_engine, read_pid_file, remove_pid_file, stop_engine, write_pid_file,
};
