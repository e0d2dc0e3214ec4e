//! 對外部系統的具體實作：H3 格網、HTTP 搜尋 API、本機儲存

pub mod h3;
pub mod http;
pub mod storage;

pub use h3::H3Grid;
pub use http::HttpSearchApi;
pub use storage::LocalStorage;
