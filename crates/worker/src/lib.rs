//! 下载、上传、来源列举等外部协作方的具体实现

pub mod classify;
pub mod command_fetcher;
pub mod feed_lister;
pub mod http_publisher;
pub mod link_fetcher;

pub use classify::{classify_http_status, classify_message, classify_reqwest_error};
pub use command_fetcher::{CommandFetcher, SKIP_MARKER};
pub use feed_lister::FeedSourceLister;
pub use http_publisher::HttpPublisher;
pub use link_fetcher::HttpLinkFetcher;
