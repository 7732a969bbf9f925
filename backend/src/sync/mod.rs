pub mod board;
pub mod synchronizer;
pub mod tags;

pub use board::{Board, BoardCard};
pub use synchronizer::{Rescheduled, StatusSynchronizer};
