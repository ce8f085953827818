use async_trait::async_trait;
use bytes::Bytes;

use super::{Backend, BackendContext};
use crate::error::Result;
use crate::provider::InputProxy;
use crate::rpc::RpcId;

/// Returns the request bytes verbatim. Holds no resources beyond its saved
/// configuration; serves as the conformance reference for the `Backend`
/// contract.
pub struct EchoBackend {
	config: serde_json::Value,
}

impl EchoBackend {
	pub(crate) async fn create(ctx: BackendContext) -> Result<Box<dyn Backend>> {
		Ok(Box::new(EchoBackend { config: ctx.config }))
	}
}

#[async_trait]
impl Backend for EchoBackend {
	fn get_config(&self) -> String {
		self.config.to_string()
	}

	async fn forward_output(&self, _rpc_id: RpcId, input: Bytes) -> Result<Bytes> {
		Ok(input)
	}

	fn set_input_proxy(&self, _proxy: InputProxy) {}

	async fn destroy(&self) -> Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::{Engine, rpc_id_of};

	#[tokio::test]
	async fn output_equals_input() {
		let ctx = BackendContext {
			engine: Engine::client(),
			config: serde_json::json!({}),
			target: None,
		};
		let backend = EchoBackend::create(ctx).await.unwrap();
		for input in [
			Bytes::new(),
			Bytes::from_static(b"Matthieu Dorier"),
			Bytes::from(vec![0u8, 255, 7, 42]),
		] {
			let output = backend
				.forward_output(rpc_id_of("my_rpc"), input.clone())
				.await
				.unwrap();
			assert_eq!(output, input);
		}
		backend.destroy().await.unwrap();
	}
}
