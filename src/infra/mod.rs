pub mod http_client;
pub mod scripted_http;

pub use http_client::ReqwestHttp;
pub use scripted_http::ScriptedHttp;
