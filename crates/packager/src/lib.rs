mod error_log;
mod packager;
pub mod tasks;
mod zip_helper;

pub use error_log::{
    format_error_log,
    ErrorEntry,
};
pub use packager::{
    Packager,
    PresignedUrlInfo,
};
pub use zip_helper::zip_files;
