//! JSON-RPC client for monerod and monero-wallet-rpc.

mod endpoint;
mod error;
mod transport;
mod types;

pub use endpoint::{DEFAULT_RPC_PATH, DEFAULT_TIMEOUT, RpcCredentials, RpcEndpoint, RpcEndpointBuilder, RpcKind};
pub use error::{ConfigError, RpcClientError, RpcError, TransportError};
pub use transport::RpcTransport;
pub use types::{JSONRPC_VERSION, JsonRpcRequest, into_rpc_result};
