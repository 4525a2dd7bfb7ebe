mod client;
pub mod fake;
pub mod poller;
mod trait_def;
mod types;

pub use client::HttpTableService;
pub use fake::{
    BulkFixture,
    FakeTableService,
};
pub use poller::{
    poll,
    PollError,
};
pub use trait_def::TableService;
pub use types::{
    BulkDownloadRequest,
    BulkDownloadResult,
    DownloadResult,
    HandleResult,
    JobToken,
    TableEntity,
};
