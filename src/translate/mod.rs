pub mod claude;
pub mod gemini;
pub mod request;
pub mod response;
pub mod schema;
pub mod signatures;

pub use request::build_upstream_request;
pub use response::convert_response;
pub use schema::clean_json_schema;
pub use signatures::SignatureCache;
