//! LPR processing – pulls footage for recorded events, trims it to the
//! motion window and stores the result in SQLite.

pub mod db;
pub mod fetch;
pub mod motion;
pub mod pipeline;
pub mod protect;
pub mod retention;
pub mod retry;
pub mod tools;
pub mod trim;
