pub mod api;
pub mod http;

pub use api::HostApi;
pub use http::{BoxStream, HttpClient, HttpResponse};

#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
