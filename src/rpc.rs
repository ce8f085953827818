//! The native RPC engine: named handlers, invocation by id on remote
//! endpoints, identity probes, and engine lifecycle. Names hash to stable
//! 64-bit ids, so the same name resolves to the same id on every host.

mod engine;
mod wire;

pub use engine::{Endpoint, Engine, Handler, ProviderHandle, handler};
pub use wire::{RemoteProcedure, RpcId, rpc_id_of};
