mod admin;
mod files;

pub use admin::health;
pub use files::{delete_file, download_file, upload_file};
