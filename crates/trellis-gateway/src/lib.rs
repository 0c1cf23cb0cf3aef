// Trellis Gateway
//
// The HTTP boundary: resolves a bearer token into per-request credentials,
// dispatches the four generic data operations (signature, discovery,
// retrieval, storage) through the accessor registry, and maps the library
// error taxonomy onto HTTP statuses.

pub mod config;
pub mod credentials;
pub mod error;
pub mod routes;
pub mod service;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use service::DataService;
