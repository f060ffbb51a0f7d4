//! Storage for the metrics mart: HTTP transport for the source connectors, the
//! raw-response archive, and the staging/datamart warehouse backends.

mod archive;
mod http;
pub mod warehouse;

pub use archive::{write_file_atomically, ArchivedResponse, RawResponseArchive};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, HttpRequest, RequestBody, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use warehouse::{
    FileWarehouse, MemoryWarehouse, PgWarehouse, PoolConfig, Warehouse, WarehouseError,
    WarehouseTarget,
};

pub const CRATE_NAME: &str = "tmart-storage";
