pub mod defer;
pub mod hex;
pub mod http;
