pub mod headers;
pub mod method;
pub mod multipart;
pub mod request;
pub mod response;
pub mod uri;
