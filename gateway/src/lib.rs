//! Umbrella crate for the gateway data retrieval core: re-exports the
//! workspace members and wires a working core from one config struct. HTTP
//! routing lives outside this workspace; the [`headers`] module carries the
//! header names and formatting the serving layer needs at the boundary.

pub use arweave_gateway_chain as chain;
pub use arweave_gateway_data as data;
pub use arweave_gateway_indexes as indexes;
pub use arweave_gateway_limiter as limiter;
pub use arweave_gateway_peers as peers;
pub use arweave_gateway_types as types;
pub use arweave_gateway_validator as validator;

pub mod config;
pub mod headers;

pub use config::{GatewayConfig, GatewayCore};
