use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::provider::IDENTITY;
use crate::rpc::{Engine, ProviderHandle, rpc_id_of};

/// Entry point for callers: binds to an engine and resolves proxy handles.
#[derive(Clone)]
pub struct Client {
	engine: Engine,
}

impl Client {
	pub fn new(engine: &Engine) -> Client {
		Client {
			engine: engine.clone(),
		}
	}

	pub fn engine(&self) -> &Engine {
		&self.engine
	}

	/// Resolve a handle to a proxy at `address` with the given provider id.
	/// With `check` set, the endpoint's advertised identity is probed and
	/// must match; without it no RPC is issued, for callers that already
	/// know the proxy exists.
	pub async fn make_proxy_handle(
		&self,
		address: &str,
		provider_id: u16,
		check: bool,
	) -> Result<ProxyHandle> {
		let endpoint = self.engine.lookup(address).await?;
		if check {
			let location = format!("{address} (provider id {provider_id})");
			let identity = endpoint
				.identity(provider_id)
				.await
				.map_err(|_| Error::NotAProvider(location.clone()))?;
			if identity != IDENTITY {
				return Err(Error::NotAProvider(location));
			}
		}
		Ok(ProxyHandle {
			handle: ProviderHandle::new(endpoint, provider_id),
		})
	}
}

/// A resolved handle to an active proxy. Invocations carry the request
/// bytes opaquely and resolve with the proxy's response bytes.
#[derive(Clone)]
pub struct ProxyHandle {
	handle: ProviderHandle,
}

impl ProxyHandle {
	pub fn provider_id(&self) -> u16 {
		self.handle.provider_id
	}

	/// Invoke an exported RPC by name and suspend until the response.
	pub async fn forward(&self, rpc_name: &str, input: Bytes) -> Result<Bytes> {
		self.handle.call(rpc_id_of(rpc_name), input).await
	}

	/// Invoke an exported RPC without waiting; the returned request's
	/// `wait()` yields the result.
	pub fn forward_async(&self, rpc_name: &str, input: Bytes) -> AsyncRequest {
		let handle = self.handle.clone();
		let rpc_id = rpc_id_of(rpc_name);
		AsyncRequest {
			task: tokio::spawn(async move { handle.call(rpc_id, input).await }),
		}
	}
}

/// An in-flight asynchronous invocation.
pub struct AsyncRequest {
	task: JoinHandle<Result<Bytes>>,
}

impl AsyncRequest {
	pub async fn wait(self) -> Result<Bytes> {
		self
			.task
			.await
			.map_err(|e| Error::Transport(format!("async request task failed: {e}")))?
	}
}
