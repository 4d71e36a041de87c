pub mod db;
pub mod models;
mod revisions;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;
