use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{Backend, BackendContext};
use crate::bus::{PubSocket, SubSocket};
use crate::error::{Error, Result};
use crate::provider::InputProxy;
use crate::rpc::RpcId;

const HEADER_LEN: usize = 17;

/// Fixed-layout header preceding the payload in every bus frame. The
/// correlation token is minted by the requester and echoed verbatim by the
/// responder; it is never interpreted in transit.
struct FrameHeader {
	token: u64,
	rpc_id: RpcId,
	is_forward: bool,
}

impl FrameHeader {
	fn encode_with(&self, payload: &[u8]) -> Bytes {
		// The sub socket owns its receive buffers, so the payload is copied
		// into the outgoing message here; callers upstream never copy.
		let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
		buf.put_u64_le(self.token);
		buf.put_u64_le(self.rpc_id);
		buf.put_u8(self.is_forward as u8);
		buf.extend_from_slice(payload);
		buf.freeze()
	}

	fn decode(frame: &Bytes) -> Result<(FrameHeader, Bytes)> {
		if frame.len() < HEADER_LEN {
			return Err(Error::transport("truncated bus frame"));
		}
		let header = FrameHeader {
			token: LittleEndian::read_u64(&frame[0..8]),
			rpc_id: LittleEndian::read_u64(&frame[8..16]),
			is_forward: frame[16] != 0,
		};
		Ok((header, frame.slice(HEADER_LEN..)))
	}
}

#[derive(Deserialize)]
struct PubSubConfig {
	pub_address: String,
	sub_address: String,
}

/// State shared between the backend and its polling task.
struct Shared {
	// Outstanding requests by correlation token. The polling task only ever
	// removes the entry the token resolves to.
	pending: Mutex<HashMap<u64, oneshot::Sender<Bytes>>>,
	next_token: AtomicU64,
	input_proxy: Mutex<Option<InputProxy>>,
}

/// Bridges two proxies over a duplex pub/sub bus. Requests are published
/// with a fresh correlation token and the caller suspends until the polling
/// task sees the response frame echoing that token, so any number of
/// requests may be outstanding and responses may arrive in any order.
pub struct PubSubBackend {
	config: serde_json::Value,
	publisher: PubSocket,
	shared: Arc<Shared>,
	stop: CancellationToken,
	poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubBackend {
	pub(crate) async fn create(ctx: BackendContext) -> Result<Box<dyn Backend>> {
		let config: PubSubConfig = serde_json::from_value(ctx.config)
			.map_err(|e| Error::Config(format!("invalid pub/sub config: {e}")))?;

		// Bind/connect failures here are fatal for the provider.
		let publisher = PubSocket::open(&config.pub_address).await?;
		let subscriber = SubSocket::open(&config.sub_address).await?;

		let shared = Arc::new(Shared {
			pending: Mutex::new(HashMap::new()),
			next_token: AtomicU64::new(1),
			input_proxy: Mutex::new(None),
		});
		let stop = CancellationToken::new();
		let poll_task = tokio::spawn(poll_loop(
			subscriber,
			publisher.clone(),
			shared.clone(),
			stop.clone(),
		));

		Ok(Box::new(PubSubBackend {
			config: serde_json::json!({
				"pub_address": config.pub_address,
				"sub_address": config.sub_address,
			}),
			publisher,
			shared,
			stop,
			poll_task: Mutex::new(Some(poll_task)),
		}))
	}
}

#[async_trait]
impl Backend for PubSubBackend {
	fn get_config(&self) -> String {
		self.config.to_string()
	}

	async fn forward_output(&self, rpc_id: RpcId, input: Bytes) -> Result<Bytes> {
		let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
		let (completion, response) = oneshot::channel();
		self
			.shared
			.pending
			.lock()
			.expect("correlation table poisoned")
			.insert(token, completion);

		let frame = FrameHeader {
			token,
			rpc_id,
			is_forward: true,
		}
		.encode_with(&input);
		if let Err(e) = self.publisher.send(frame).await {
			self
				.shared
				.pending
				.lock()
				.expect("correlation table poisoned")
				.remove(&token);
			return Err(e);
		}
		trace!(token, rpc_id, "published request frame");

		// The polling task completes the entry when the matching response
		// frame arrives; destroy drops the table, which wakes us with an
		// error instead.
		response
			.await
			.map_err(|_| Error::transport("pub/sub backend destroyed before the response arrived"))
	}

	fn set_input_proxy(&self, proxy: InputProxy) {
		*self
			.shared
			.input_proxy
			.lock()
			.expect("input proxy slot poisoned") = Some(proxy);
	}

	async fn destroy(&self) -> Result<()> {
		self.stop.cancel();
		let task = self
			.poll_task
			.lock()
			.expect("poll task slot poisoned")
			.take();
		if let Some(task) = task {
			let _ = task.await;
		}
		self.publisher.close();
		self
			.shared
			.pending
			.lock()
			.expect("correlation table poisoned")
			.clear();
		Ok(())
	}
}

/// One long-lived task per backend: drain the sub socket until told to stop.
/// Forward frames re-enter the provider's input path and the response goes
/// back out under the same token; response frames complete the matching
/// correlation entry.
async fn poll_loop(
	mut subscriber: SubSocket,
	publisher: PubSocket,
	shared: Arc<Shared>,
	stop: CancellationToken,
) {
	loop {
		let frame = tokio::select! {
			_ = stop.cancelled() => break,
			frame = subscriber.recv() => match frame {
				Some(frame) => frame,
				None => {
					debug!("sub socket closed, stopping polling task");
					break;
				},
			},
		};
		let (header, payload) = match FrameHeader::decode(&frame) {
			Ok(decoded) => decoded,
			Err(e) => {
				warn!("dropping malformed bus frame: {e}");
				continue;
			},
		};
		if header.is_forward {
			// Dispatch onto the scheduler so a slow downstream RPC cannot
			// hold up other correlations behind it.
			let input_proxy = shared
				.input_proxy
				.lock()
				.expect("input proxy slot poisoned")
				.clone();
			tokio::spawn(handle_forward(header, payload, input_proxy, publisher.clone()));
		} else {
			let entry = shared
				.pending
				.lock()
				.expect("correlation table poisoned")
				.remove(&header.token);
			match entry {
				Some(completion) => {
					trace!(token = header.token, "completing correlation entry");
					let _ = completion.send(payload);
				},
				None => debug!(
					token = header.token,
					"dropping response with unknown or stale correlation token"
				),
			}
		}
	}
}

async fn handle_forward(
	header: FrameHeader,
	payload: Bytes,
	input_proxy: Option<InputProxy>,
	publisher: PubSocket,
) {
	let Some(proxy) = input_proxy else {
		warn!("received forward frame before the input proxy was installed");
		return;
	};
	match proxy.forward_input(header.rpc_id, payload).await {
		Ok(output) => {
			let response = FrameHeader {
				token: header.token,
				rpc_id: header.rpc_id,
				is_forward: false,
			}
			.encode_with(&output);
			if let Err(e) = publisher.send(response).await {
				warn!("could not publish response frame: {e}");
			}
		},
		// The bus has no error channel; the remote caller observes the
		// failure as a missing response.
		Err(e) => error!(rpc_id = header.rpc_id, "forwarding input failed: {e}"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::rpc_id_of;

	#[test]
	fn header_round_trip() {
		let frame = FrameHeader {
			token: 99,
			rpc_id: rpc_id_of("hello"),
			is_forward: true,
		}
		.encode_with(b"Matthieu Dorier");
		assert_eq!(frame.len(), HEADER_LEN + 15);

		let (header, payload) = FrameHeader::decode(&frame).unwrap();
		assert_eq!(header.token, 99);
		assert_eq!(header.rpc_id, rpc_id_of("hello"));
		assert!(header.is_forward);
		assert_eq!(payload, Bytes::from_static(b"Matthieu Dorier"));
	}

	#[test]
	fn rejects_short_frames() {
		assert!(FrameHeader::decode(&Bytes::from_static(&[0; 16])).is_err());
	}

	#[tokio::test]
	async fn missing_addresses_are_fatal() {
		let ctx = BackendContext {
			engine: crate::rpc::Engine::client(),
			config: serde_json::json!({"pub_address": "tcp://*:0"}),
			target: None,
		};
		assert!(matches!(
			PubSubBackend::create(ctx).await,
			Err(Error::Config(_))
		));
	}
}
