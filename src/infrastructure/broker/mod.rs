mod client;
mod websocket;
pub mod wire;

pub use client::HttpBrokerAdapter;
pub use websocket::LtpWebSocket;
