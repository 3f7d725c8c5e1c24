pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extractor;
pub mod job_queue;
pub mod jobs;
pub mod ledger;
pub mod polling;
pub mod pricing;
pub mod provider;
pub mod rate_limit;
pub mod reconciler;
pub mod retry;
pub mod routes;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod webhooks;
