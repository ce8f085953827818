use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::error::Result;
use crate::provider::InputProxy;
use crate::rpc::{Engine, ProviderHandle, RpcId};

pub mod echo;
pub mod passthrough;
pub mod pubsub;

/// Contract every proxy transport implements. Backends are selected by name
/// through the registry and addressed only through this capability set.
#[async_trait]
pub trait Backend: Send + Sync {
	/// Effective configuration as a JSON-formatted string.
	fn get_config(&self) -> String;

	/// Transport the request bytes out and resolve with the response bytes.
	/// The future completes only once the response exists; a transport that
	/// is asynchronous underneath suspends the calling task until the
	/// response arrives.
	async fn forward_output(&self, rpc_id: RpcId, input: Bytes) -> Result<Bytes>;

	/// Install the handle through which externally received requests
	/// re-enter the owning provider's input path. Called once, right after
	/// construction. Pure-output backends may ignore it.
	fn set_input_proxy(&self, proxy: InputProxy);

	/// Release all external resources (sockets, engines, polling tasks).
	/// Double-destroy must not crash.
	async fn destroy(&self) -> Result<()>;
}

/// Everything a backend factory gets to work with: the engine the owning
/// provider runs on, the backend-specific configuration (opaque to the
/// provider), and the provider's downstream target, when one was supplied.
pub struct BackendContext {
	pub engine: Engine,
	pub config: serde_json::Value,
	pub target: Option<ProviderHandle>,
}

pub type BackendFactory =
	Arc<dyn Fn(BackendContext) -> BoxFuture<'static, Result<Box<dyn Backend>>> + Send + Sync>;

/// Wrap an async closure as a [`BackendFactory`].
pub fn backend_factory<F, Fut>(f: F) -> BackendFactory
where
	F: Fn(BackendContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Box<dyn Backend>>> + Send + 'static,
{
	Arc::new(move |ctx| -> BoxFuture<'static, Result<Box<dyn Backend>>> { Box::pin(f(ctx)) })
}

static REGISTRY: Lazy<RwLock<HashMap<String, BackendFactory>>> = Lazy::new(|| {
	let mut backends: HashMap<String, BackendFactory> = HashMap::new();
	backends.insert("echo".to_string(), backend_factory(echo::EchoBackend::create));
	backends.insert(
		"passthrough".to_string(),
		backend_factory(passthrough::PassthroughBackend::create),
	);
	backends.insert(
		"pubsub".to_string(),
		backend_factory(pubsub::PubSubBackend::create),
	);
	RwLock::new(backends)
});

/// Register a backend factory under a name. Registering an already-known
/// name replaces the previous factory.
pub fn register_backend(name: &str, factory: BackendFactory) {
	trace!(name, "registering backend factory");
	REGISTRY
		.write()
		.expect("backend registry poisoned")
		.insert(name.to_string(), factory);
}

/// Construct a backend by registered name. Returns `None` when the name is
/// unknown; constructor failures propagate.
pub(crate) async fn create_backend(
	name: &str,
	ctx: BackendContext,
) -> Result<Option<Box<dyn Backend>>> {
	let factory = REGISTRY
		.read()
		.expect("backend registry poisoned")
		.get(name)
		.cloned();
	match factory {
		Some(factory) => Ok(Some(factory(ctx).await?)),
		None => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn unknown_backend_name_yields_none() {
		let ctx = BackendContext {
			engine: Engine::client(),
			config: serde_json::json!({}),
			target: None,
		};
		assert!(create_backend("no-such", ctx).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn registration_replaces_duplicates() {
		register_backend("dup-test", backend_factory(echo::EchoBackend::create));
		register_backend("dup-test", backend_factory(echo::EchoBackend::create));
		let ctx = BackendContext {
			engine: Engine::client(),
			config: serde_json::json!({"marker": 1}),
			target: None,
		};
		let backend = create_backend("dup-test", ctx).await.unwrap().unwrap();
		assert_eq!(backend.get_config(), r#"{"marker":1}"#);
	}
}
