//! HTTP/1.1 request parsing and proxy response shapes

mod parser;
mod request;
mod response;

pub use parser::{ParseError, RequestParser, MAX_HEAD_BYTES};
pub use request::{Headers, Request, Scheme, TargetParts, Version};
pub use response::{auth_challenge, error_response, response_cacheable, CONNECT_ESTABLISHED};
