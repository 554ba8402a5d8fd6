//! HTTP primitives shared by the proxy, the browsers and the plugins

pub mod cookies;
pub mod headers;

pub use cookies::Cookie;
pub use headers::HttpHeaders;
