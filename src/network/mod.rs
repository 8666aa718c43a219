//! Client-facing RPC: framing, server and client.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::GatewayClient;
pub use rpc::{
    ErrorKind, ErrorResponse, ExecResponse, GatewayRequest, GatewayResponse, Message,
    SimpleResult, MAX_FRAME_SIZE,
};
pub use server::{NetworkServer, RequestHandler};
