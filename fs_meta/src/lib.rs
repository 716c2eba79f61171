// fs_meta keeps the forever namespace: directories, file entries and their
// chunk records, all in one sqlite db.

mod dir_service;
mod meta_db;

pub use dir_service::*;
pub use meta_db::*;

#[cfg(test)]
mod dir_service_tests;
