use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::backend::{self, Backend, BackendContext};
use crate::config::{Direction, ProviderConfig};
use crate::error::{Error, Result};
use crate::rpc::{self, Engine, ProviderHandle, RpcId};

/// Identity string advertised by every provider, so a client can verify a
/// handle actually points at a proxy before using it.
pub const IDENTITY: &str = "kage";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
	Building,
	Ready,
	Destroying,
	Gone,
}

/// A provider exports a set of RPC names and interposes on them: requests
/// arriving on the engine go out through the backend (`out` direction), and
/// requests the backend receives from its external peer come back in and are
/// re-issued, same name, against the configured target (`in` direction).
/// The payload passes through opaquely in both directions.
pub struct Provider {
	core: Arc<ProviderCore>,
}

struct ProviderCore {
	engine: Engine,
	provider_id: u16,
	direction: Direction,
	backend_type: String,
	target: Option<ProviderHandle>,
	state: Mutex<State>,
	rpcs_by_id: RwLock<HashMap<RpcId, String>>,
	rpcs_by_name: RwLock<HashMap<String, RpcId>>,
	backend: OnceLock<Box<dyn Backend>>,
}

impl Provider {
	/// Validate the JSON configuration, export the configured RPC names,
	/// construct the backend and wire it back to this provider. All
	/// failures here are fatal; nothing stays registered on error.
	pub async fn new(
		engine: &Engine,
		provider_id: u16,
		config: &str,
		target: Option<ProviderHandle>,
	) -> Result<Provider> {
		let config = ProviderConfig::from_json(config)?;
		if config.direction.is_input() && target.is_none() {
			return Err(Error::config(
				"input proxy needs a target provider to redirect input to",
			));
		}

		let core = Arc::new(ProviderCore {
			engine: engine.clone(),
			provider_id,
			direction: config.direction,
			backend_type: config.proxy.backend_type.clone(),
			target,
			state: Mutex::new(State::Building),
			rpcs_by_id: RwLock::new(HashMap::new()),
			rpcs_by_name: RwLock::new(HashMap::new()),
			backend: OnceLock::new(),
		});

		// Exported names: with an output direction each one gets a handler
		// on the engine; a pure-input provider only binds caller stubs and
		// records the ids.
		for name in &config.exported_rpcs {
			let rpc = if config.direction.is_output() {
				let weak = Arc::downgrade(&core);
				let handler = rpc::handler(move |rpc_id, payload| {
					let weak = weak.clone();
					async move {
						let core = weak.upgrade().ok_or(Error::StaleProxy)?;
						core.forward_rpc_to_output(rpc_id, payload).await
					}
				});
				engine.register(provider_id, name, handler)
			} else {
				engine.define(name)
			};
			core
				.rpcs_by_id
				.write()
				.expect("RPC table poisoned")
				.insert(rpc.id, name.clone());
			core
				.rpcs_by_name
				.write()
				.expect("RPC table poisoned")
				.insert(name.clone(), rpc.id);
		}

		let ctx = BackendContext {
			engine: engine.clone(),
			config: config.proxy.config.clone(),
			target: core.target.clone(),
		};
		let backend = match backend::create_backend(&config.proxy.backend_type, ctx).await {
			Ok(Some(backend)) => backend,
			Ok(None) => {
				core.teardown_registrations();
				return Err(Error::UnknownBackend(config.proxy.backend_type));
			},
			Err(e) => {
				core.teardown_registrations();
				return Err(e);
			},
		};
		backend.set_input_proxy(InputProxy {
			core: Arc::downgrade(&core),
		});
		if core.backend.set(backend).is_err() {
			return Err(Error::config("backend installed twice"));
		}

		engine.set_identity(provider_id, IDENTITY);
		let finalize_core = core.clone();
		engine.push_finalize_callback(
			provider_id,
			Box::new(move || -> BoxFuture<'static, ()> {
				Box::pin(async move {
					if let Err(e) = finalize_core.destroy(false).await {
						debug!(
							provider_id = finalize_core.provider_id,
							"provider teardown at engine finalize: {e}"
						);
					}
				})
			}),
		);

		*core.state.lock().expect("state poisoned") = State::Ready;
		debug!(
			provider_id,
			backend_type = %core.backend_type,
			"provider ready"
		);
		Ok(Provider { core })
	}

	pub fn provider_id(&self) -> u16 {
		self.core.provider_id
	}

	/// Effective configuration of the provider as a JSON-formatted string.
	pub fn get_config(&self) -> String {
		let mut exported: Vec<String> = self
			.core
			.rpcs_by_name
			.read()
			.expect("RPC table poisoned")
			.keys()
			.cloned()
			.collect();
		exported.sort();
		let backend_config = self
			.core
			.backend
			.get()
			.and_then(|b| serde_json::from_str(&b.get_config()).ok())
			.unwrap_or(serde_json::Value::Null);
		serde_json::json!({
			"direction": self.core.direction,
			"exported_rpcs": exported,
			"proxy": {
				"type": self.core.backend_type,
				"config": backend_config,
			},
		})
		.to_string()
	}

	/// Deregister the exported RPCs and destroy the backend. Operations
	/// arriving after this starts are rejected without side effects.
	pub async fn destroy(&self) -> Result<()> {
		self.core.destroy(true).await
	}
}

impl ProviderCore {
	fn check_ready(&self) -> Result<()> {
		if *self.state.lock().expect("state poisoned") == State::Ready {
			Ok(())
		} else {
			Err(Error::ProviderInactive)
		}
	}

	/// Output path: an RPC addressed to this provider is handed, bytes
	/// untouched, to the backend; the backend's response bytes become the
	/// reply.
	async fn forward_rpc_to_output(&self, rpc_id: RpcId, payload: Bytes) -> Result<Bytes> {
		self.check_ready()?;
		trace!(
			provider_id = self.provider_id,
			rpc_id, "forwarding RPC to output"
		);
		let backend = self.backend.get().ok_or(Error::ProviderInactive)?;
		backend.forward_output(rpc_id, payload).await
	}

	/// Input path: the backend received an external request; re-issue the
	/// same-named RPC against the configured target.
	async fn forward_rpc_to_input(&self, rpc_id: RpcId, payload: Bytes) -> Result<Bytes> {
		self.check_ready()?;
		let name = self
			.rpcs_by_id
			.read()
			.expect("RPC table poisoned")
			.get(&rpc_id)
			.cloned()
			.ok_or(Error::UnknownRpc(rpc_id))?;
		let target = self
			.target
			.as_ref()
			.ok_or_else(|| Error::config("provider has no input target"))?;
		trace!(
			provider_id = self.provider_id,
			rpc_id,
			name = %name,
			"forwarding input RPC to target"
		);
		target.call(rpc_id, payload).await
	}

	fn teardown_registrations(&self) {
		if self.direction.is_output() {
			for rpc_id in self.rpcs_by_id.read().expect("RPC table poisoned").keys() {
				self.engine.deregister(self.provider_id, *rpc_id);
			}
		}
		self.rpcs_by_id.write().expect("RPC table poisoned").clear();
		self
			.rpcs_by_name
			.write()
			.expect("RPC table poisoned")
			.clear();
	}

	async fn destroy(&self, pop_finalize: bool) -> Result<()> {
		{
			let mut state = self.state.lock().expect("state poisoned");
			match *state {
				State::Ready => *state = State::Destroying,
				_ => return Err(Error::ProviderInactive),
			}
		}
		trace!(provider_id = self.provider_id, "destroying provider");
		if pop_finalize {
			self.engine.pop_finalize_callback(self.provider_id);
		}
		self.teardown_registrations();
		self.engine.clear_identity(self.provider_id);
		if let Some(backend) = self.backend.get() {
			backend.destroy().await?;
		}
		*self.state.lock().expect("state poisoned") = State::Gone;
		debug!(provider_id = self.provider_id, "provider destroyed");
		Ok(())
	}
}

/// Non-owning back-reference by which a backend re-enters the provider's
/// input path. The referent is checked on every call; after the provider is
/// gone, calls fail cleanly instead of dereferencing freed state.
#[derive(Clone)]
pub struct InputProxy {
	core: Weak<ProviderCore>,
}

impl InputProxy {
	pub fn is_valid(&self) -> bool {
		self.core.strong_count() > 0
	}

	pub async fn forward_input(&self, rpc_id: RpcId, payload: Bytes) -> Result<Bytes> {
		let core = self.core.upgrade().ok_or(Error::StaleProxy)?;
		core.forward_rpc_to_input(rpc_id, payload).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::backend::register_backend;

	#[tokio::test]
	async fn input_direction_requires_a_target() {
		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		let config = r#"{
			"direction": "in",
			"proxy": {"type": "echo"},
			"exported_rpcs": ["hello"]
		}"#;
		let result = Provider::new(&engine, 1, config, None).await;
		assert!(matches!(result, Err(Error::Config(_))));
		engine.finalize().await;
	}

	#[tokio::test]
	async fn unknown_backend_is_fatal() {
		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		let config = r#"{
			"direction": "out",
			"proxy": {"type": "no-such"},
			"exported_rpcs": ["hello"]
		}"#;
		match Provider::new(&engine, 1, config, None).await {
			Err(Error::UnknownBackend(name)) => assert_eq!(name, "no-such"),
			Err(other) => panic!("unexpected error: {other}"),
			Ok(_) => panic!("construction should have failed"),
		}
		engine.finalize().await;
	}

	#[tokio::test]
	async fn malformed_config_is_fatal() {
		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		let result = Provider::new(&engine, 1, "not json at all", None).await;
		assert!(matches!(result, Err(Error::Config(_))));
		engine.finalize().await;
	}

	/// A backend that leaks its input proxy to the test so staleness can be
	/// observed from outside.
	struct CapturingBackend {
		slot: Arc<Mutex<Option<InputProxy>>>,
	}

	#[async_trait::async_trait]
	impl Backend for CapturingBackend {
		fn get_config(&self) -> String {
			"{}".to_string()
		}

		async fn forward_output(&self, _rpc_id: RpcId, input: Bytes) -> Result<Bytes> {
			Ok(input)
		}

		fn set_input_proxy(&self, proxy: InputProxy) {
			*self.slot.lock().unwrap() = Some(proxy);
		}

		async fn destroy(&self) -> Result<()> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn input_proxy_goes_stale_after_the_provider_is_gone() {
		let slot: Arc<Mutex<Option<InputProxy>>> = Arc::new(Mutex::new(None));
		let factory_slot = slot.clone();
		register_backend(
			"capture",
			crate::backend::backend_factory(move |_ctx| {
				let slot = factory_slot.clone();
				async move { Ok(Box::new(CapturingBackend { slot }) as Box<dyn Backend>) }
			}),
		);

		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		let target_rpc = rpc::handler(|_rpc_id, payload| async move { Ok(payload) });
		engine.register(9, "hello", target_rpc);
		let endpoint = engine.lookup(&engine.address().unwrap()).await.unwrap();
		let target = ProviderHandle::new(endpoint, 9);

		let config = r#"{
			"direction": "inout",
			"proxy": {"type": "capture"},
			"exported_rpcs": ["hello"]
		}"#;
		let provider = Provider::new(&engine, 2, config, Some(target)).await.unwrap();
		let proxy = slot.lock().unwrap().clone().unwrap();
		assert!(proxy.is_valid());

		// While the provider is alive the input path works end to end.
		let rpc_id = crate::rpc::rpc_id_of("hello");
		let output = proxy
			.forward_input(rpc_id, Bytes::from_static(b"ping"))
			.await
			.unwrap();
		assert_eq!(output, Bytes::from_static(b"ping"));

		// Unknown ids are rejected without touching the target.
		assert!(matches!(
			proxy.forward_input(0xdead_beef, Bytes::new()).await,
			Err(Error::UnknownRpc(_))
		));

		provider.destroy().await.unwrap();
		// Destroyed but not yet dropped: rejected by the state machine.
		assert!(matches!(
			proxy.forward_input(rpc_id, Bytes::new()).await,
			Err(Error::ProviderInactive)
		));

		drop(provider);
		assert!(!proxy.is_valid());
		assert!(matches!(
			proxy.forward_input(rpc_id, Bytes::new()).await,
			Err(Error::StaleProxy)
		));

		engine.finalize().await;
	}

	#[tokio::test]
	async fn double_destroy_is_rejected_cleanly() {
		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		let config = r#"{
			"direction": "out",
			"proxy": {"type": "echo"},
			"exported_rpcs": ["my_rpc"]
		}"#;
		let provider = Provider::new(&engine, 3, config, None).await.unwrap();
		provider.destroy().await.unwrap();
		assert!(matches!(
			provider.destroy().await,
			Err(Error::ProviderInactive)
		));
		engine.finalize().await;
	}
}
