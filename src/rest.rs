//! Fixed identifiers shared with the remote query service.
//!
//! These values are part of the wire contract and must match the service
//! byte-for-byte.

/// Path prefix of the query-execution endpoint.
pub const QUERY_PATH: &str = "/queries/v1/query-request";

/// Query parameter carrying the retry number of a query request.
pub const RETRY_COUNT_PARAM: &str = "retryCount";

/// Query parameter carrying the request correlation guid.
pub const REQUEST_GUID_PARAM: &str = "request_guid";
