mod http;

pub use http::HttpTableService;
