mod http_transport;
mod retry_policy;

pub use http_transport::{HttpTransport, UpstreamRequest};
pub(crate) use http_transport::error_chain_message;
pub use retry_policy::RetryPolicy;
