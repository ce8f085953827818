//! Transparent RPC proxy.
//!
//! A [`Provider`] exports a set of RPC names under a provider id and relays
//! every invocation, request and response bytes untouched, through a
//! pluggable [`Backend`]: `echo` replies with the request itself,
//! `passthrough` re-invokes the same-named RPC on a peer over the native
//! engine, and `pubsub` bridges two providers over a duplex publish/subscribe
//! bus with out-of-order response correlation. Chaining two proxies over a
//! non-native transport yields gateway and protocol-translation topologies
//! without the callers or the downstream targets knowing a proxy exists.
//!
//! ```no_run
//! use bytes::Bytes;
//! use kage::rpc::Engine;
//! use kage::{Client, Provider};
//!
//! # async fn run() -> kage::Result<()> {
//! let engine = Engine::listen("127.0.0.1:0").await?;
//! let provider = Provider::new(
//! 	&engine,
//! 	42,
//! 	r#"{
//! 		"direction": "out",
//! 		"exported_rpcs": ["my_rpc"],
//! 		"proxy": {"type": "echo"}
//! 	}"#,
//! 	None,
//! )
//! .await?;
//!
//! let client = Client::new(&engine);
//! let proxy = client.make_proxy_handle(&engine.address()?, 42, true).await?;
//! let reply = proxy.forward("my_rpc", Bytes::from_static(b"hi")).await?;
//! assert_eq!(reply, Bytes::from_static(b"hi"));
//! # provider.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bus;
mod client;
mod config;
mod error;
mod provider;
pub mod rpc;

pub use backend::{Backend, BackendContext, BackendFactory, backend_factory, register_backend};
pub use client::{AsyncRequest, Client, ProxyHandle};
pub use config::{Direction, ProviderConfig, ProxySpec};
pub use error::{Error, Result};
pub use provider::{IDENTITY, InputProxy, Provider};
