use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::{Backend, BackendContext};
use crate::error::{Error, Result};
use crate::provider::InputProxy;
use crate::rpc::{self, Engine, ProviderHandle, RemoteProcedure, RpcId};

/// Name of the bridge RPC used between two internal engines. Its payload is
/// the forwarded RPC's id followed by the opaque request bytes, so the
/// receiving side can re-enter its provider without a name lookup.
const FORWARD_RPC: &str = "kage_forward";

/// Provider id under which the bridge handler registers on the internal
/// engine. Internal engines carry nothing else.
const BRIDGE_PROVIDER_ID: u16 = 0;

#[derive(Deserialize)]
struct BridgeConfig {
	address: String,
	remote_address: String,
	listening: bool,
}

/// Re-invokes the same-named RPC (by id) on a peer through the native RPC
/// engine. With an empty configuration the peer is the owning provider's
/// target on the outer engine; with `{address, remote_address, listening}`
/// the backend runs a second engine of its own and forwards through the
/// bridge RPC, pairing up with a passthrough backend on the remote side.
pub struct PassthroughBackend {
	config: serde_json::Value,
	input_proxy: Arc<Mutex<Option<InputProxy>>>,
	mode: Mode,
}

enum Mode {
	Local {
		target: ProviderHandle,
	},
	Bridge {
		engine: Engine,
		remote_address: String,
		// Resolved on first use: the remote bridge may not be up yet while
		// both sides are constructing, and a pure-output peer never listens.
		remote: OnceCell<ProviderHandle>,
		forward_rpc: RemoteProcedure,
	},
}

impl PassthroughBackend {
	pub(crate) async fn create(ctx: BackendContext) -> Result<Box<dyn Backend>> {
		let is_bridge = ctx
			.config
			.as_object()
			.is_some_and(|object| !object.is_empty());
		let input_proxy: Arc<Mutex<Option<InputProxy>>> = Arc::new(Mutex::new(None));
		if !is_bridge {
			let target = ctx.target.ok_or_else(|| {
				Error::config("passthrough backend requires a target provider to forward to")
			})?;
			return Ok(Box::new(PassthroughBackend {
				config: ctx.config,
				input_proxy,
				mode: Mode::Local { target },
			}));
		}

		let bridge: BridgeConfig = serde_json::from_value(ctx.config)
			.map_err(|e| Error::Config(format!("invalid passthrough config: {e}")))?;
		let engine = if bridge.listening {
			let engine = Engine::listen(&bridge.address).await?;
			let shared = input_proxy.clone();
			let handler = rpc::handler(move |_rpc_id, payload| {
				let shared = shared.clone();
				async move {
					let (rpc_id, data) = decode_bridge_payload(payload)?;
					let proxy = shared
						.lock()
						.expect("input proxy slot poisoned")
						.clone()
						.ok_or(Error::StaleProxy)?;
					proxy.forward_input(rpc_id, data).await
				}
			});
			engine.register(BRIDGE_PROVIDER_ID, FORWARD_RPC, handler);
			engine
		} else {
			Engine::client()
		};
		let forward_rpc = engine.define(FORWARD_RPC);

		let effective_address = engine.address().unwrap_or_default();
		let config = serde_json::json!({
			"address": effective_address,
			"remote_address": bridge.remote_address,
			"listening": bridge.listening,
		});
		Ok(Box::new(PassthroughBackend {
			config,
			input_proxy,
			mode: Mode::Bridge {
				engine,
				remote_address: bridge.remote_address,
				remote: OnceCell::new(),
				forward_rpc,
			},
		}))
	}
}

fn encode_bridge_payload(rpc_id: RpcId, input: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(8 + input.len());
	buf.put_u64_le(rpc_id);
	buf.extend_from_slice(input);
	buf.freeze()
}

fn decode_bridge_payload(payload: Bytes) -> Result<(RpcId, Bytes)> {
	if payload.len() < 8 {
		return Err(Error::transport("truncated bridge payload"));
	}
	let rpc_id = LittleEndian::read_u64(&payload[..8]);
	Ok((rpc_id, payload.slice(8..)))
}

#[async_trait]
impl Backend for PassthroughBackend {
	fn get_config(&self) -> String {
		self.config.to_string()
	}

	async fn forward_output(&self, rpc_id: RpcId, input: Bytes) -> Result<Bytes> {
		match &self.mode {
			Mode::Local { target } => {
				trace!(rpc_id, "forwarding to target over the outer engine");
				target.call(rpc_id, input).await
			},
			Mode::Bridge {
				engine,
				remote_address,
				remote,
				forward_rpc,
			} => {
				let remote = remote
					.get_or_try_init(|| async {
						let endpoint = engine.lookup(remote_address).await?;
						Ok::<_, Error>(ProviderHandle::new(endpoint, BRIDGE_PROVIDER_ID))
					})
					.await?;
				trace!(rpc_id, %remote_address, "forwarding through the bridge RPC");
				remote
					.call(forward_rpc.id, encode_bridge_payload(rpc_id, &input))
					.await
			},
		}
	}

	fn set_input_proxy(&self, proxy: InputProxy) {
		*self.input_proxy.lock().expect("input proxy slot poisoned") = Some(proxy);
	}

	async fn destroy(&self) -> Result<()> {
		if let Mode::Bridge {
			engine, forward_rpc, ..
		} = &self.mode
		{
			debug!("finalizing internal bridge engine");
			engine.deregister(BRIDGE_PROVIDER_ID, forward_rpc.id);
			engine.finalize().await;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bridge_payload_round_trip() {
		let rpc_id = crate::rpc::rpc_id_of("hello");
		let encoded = encode_bridge_payload(rpc_id, b"Matthieu Dorier");
		let (decoded_id, data) = decode_bridge_payload(encoded).unwrap();
		assert_eq!(decoded_id, rpc_id);
		assert_eq!(data, Bytes::from_static(b"Matthieu Dorier"));

		assert!(decode_bridge_payload(Bytes::from_static(&[1, 2, 3])).is_err());
	}

	#[tokio::test]
	async fn local_mode_requires_a_target() {
		let ctx = BackendContext {
			engine: Engine::client(),
			config: serde_json::json!({}),
			target: None,
		};
		assert!(matches!(
			PassthroughBackend::create(ctx).await,
			Err(Error::Config(_))
		));
	}

	#[tokio::test]
	async fn rejects_partial_bridge_config() {
		let ctx = BackendContext {
			engine: Engine::client(),
			config: serde_json::json!({"address": "127.0.0.1:0"}),
			target: None,
		};
		assert!(matches!(
			PassthroughBackend::create(ctx).await,
			Err(Error::Config(_))
		));
	}
}
