pub mod codec;
pub mod pipeline;
pub mod respond;
pub mod server;

pub use server::handle_http;
