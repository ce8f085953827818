use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::wire::{Frame, RemoteProcedure, RpcId};
use crate::error::{Error, Result};

/// Handler invoked when a request addressed to a `(provider id, RPC id)`
/// pair arrives. The payload is the raw request bytes of the frame; the
/// returned bytes are written to the reply frame as-is.
pub type Handler = Arc<dyn Fn(RpcId, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
	F: Fn(RpcId, Bytes) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
	Arc::new(move |rpc_id, payload| -> BoxFuture<'static, Result<Bytes>> {
		Box::pin(f(rpc_id, payload))
	})
}

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Callback run by [`Engine::finalize`], registered by components that must
/// tear down before the engine stops serving.
pub type FinalizeFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// The RPC engine: registers named handlers on behalf of providers, invokes
/// RPCs by id on remote endpoints, and answers identity probes. Names map to
/// ids the same way on every engine, so a forwarded id needs no translation.
#[derive(Clone)]
pub struct Engine {
	inner: Arc<EngineInner>,
}

struct EngineInner {
	local_addr: Option<SocketAddr>,
	handlers: RwLock<HashMap<(u16, RpcId), Handler>>,
	identities: RwLock<HashMap<u16, String>>,
	endpoints: tokio::sync::Mutex<HashMap<String, Endpoint>>,
	finalize: Mutex<Vec<(u16, FinalizeFn)>>,
	shutdown: CancellationToken,
}

impl Engine {
	/// Start an engine listening for incoming RPCs. Bind to port 0 to let
	/// the OS pick; `address()` reports the effective address.
	pub async fn listen(address: &str) -> Result<Engine> {
		let listener = TcpListener::bind(address).await?;
		let local_addr = listener.local_addr()?;
		let engine = Engine {
			inner: Arc::new(EngineInner {
				local_addr: Some(local_addr),
				handlers: RwLock::new(HashMap::new()),
				identities: RwLock::new(HashMap::new()),
				endpoints: tokio::sync::Mutex::new(HashMap::new()),
				finalize: Mutex::new(Vec::new()),
				shutdown: CancellationToken::new(),
			}),
		};
		let weak = Arc::downgrade(&engine.inner);
		let token = engine.inner.shutdown.clone();
		tokio::spawn(accept_loop(listener, weak, token));
		debug!(%local_addr, "engine listening");
		Ok(engine)
	}

	/// An engine that only originates RPCs. It has no address of its own.
	pub fn client() -> Engine {
		Engine {
			inner: Arc::new(EngineInner {
				local_addr: None,
				handlers: RwLock::new(HashMap::new()),
				identities: RwLock::new(HashMap::new()),
				endpoints: tokio::sync::Mutex::new(HashMap::new()),
				finalize: Mutex::new(Vec::new()),
				shutdown: CancellationToken::new(),
			}),
		}
	}

	pub fn address(&self) -> Result<String> {
		self
			.inner
			.local_addr
			.map(|a| a.to_string())
			.ok_or_else(|| Error::transport("engine is not listening"))
	}

	/// Resolve the id of a named RPC without registering anything.
	pub fn define(&self, name: &str) -> RemoteProcedure {
		RemoteProcedure::new(name)
	}

	/// Register a handler for `name` on behalf of `provider_id`. A later
	/// registration for the same pair replaces the earlier one.
	pub fn register(&self, provider_id: u16, name: &str, handler: Handler) -> RemoteProcedure {
		let rpc = RemoteProcedure::new(name);
		self
			.inner
			.handlers
			.write()
			.expect("handler table poisoned")
			.insert((provider_id, rpc.id), handler);
		trace!(provider_id, name, rpc_id = rpc.id, "registered RPC handler");
		rpc
	}

	pub fn deregister(&self, provider_id: u16, rpc_id: RpcId) {
		self
			.inner
			.handlers
			.write()
			.expect("handler table poisoned")
			.remove(&(provider_id, rpc_id));
	}

	/// Publish the identity string advertised to identity probes for a
	/// provider id.
	pub fn set_identity(&self, provider_id: u16, identity: &str) {
		self
			.inner
			.identities
			.write()
			.expect("identity table poisoned")
			.insert(provider_id, identity.to_string());
	}

	pub fn clear_identity(&self, provider_id: u16) {
		self
			.inner
			.identities
			.write()
			.expect("identity table poisoned")
			.remove(&provider_id);
	}

	/// Connect to a remote engine, reusing an existing connection to the
	/// same address when one is already open.
	pub async fn lookup(&self, address: &str) -> Result<Endpoint> {
		let mut endpoints = self.inner.endpoints.lock().await;
		if let Some(endpoint) = endpoints.get(address) {
			return Ok(endpoint.clone());
		}
		let endpoint = Endpoint::connect(address).await?;
		endpoints.insert(address.to_string(), endpoint.clone());
		Ok(endpoint)
	}

	/// Register a callback to run when the engine is finalized. The key
	/// identifies the owner so the callback can be popped again.
	pub fn push_finalize_callback(&self, key: u16, callback: FinalizeFn) {
		self
			.inner
			.finalize
			.lock()
			.expect("finalize list poisoned")
			.push((key, callback));
	}

	pub fn pop_finalize_callback(&self, key: u16) -> bool {
		let mut callbacks = self.inner.finalize.lock().expect("finalize list poisoned");
		let before = callbacks.len();
		callbacks.retain(|(k, _)| *k != key);
		before != callbacks.len()
	}

	/// Run finalize callbacks, then stop serving and drop connections.
	pub async fn finalize(&self) {
		let callbacks: Vec<(u16, FinalizeFn)> = {
			let mut list = self.inner.finalize.lock().expect("finalize list poisoned");
			list.drain(..).collect()
		};
		for (key, callback) in callbacks {
			trace!(key, "running engine finalize callback");
			callback().await;
		}
		self.inner.shutdown.cancel();
		self.inner.endpoints.lock().await.clear();
	}
}

impl std::fmt::Debug for Engine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Engine")
			.field("local_addr", &self.inner.local_addr)
			.finish_non_exhaustive()
	}
}

async fn accept_loop(listener: TcpListener, engine: Weak<EngineInner>, token: CancellationToken) {
	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					trace!(%peer, "accepted engine connection");
					tokio::spawn(serve_connection(stream, engine.clone(), token.clone()));
				},
				Err(e) => {
					warn!("accept failed: {e}");
				},
			},
		}
	}
}

/// Serve one inbound connection: decode request frames, dispatch each to its
/// handler as its own task so a suspended handler does not block the
/// connection, and funnel response frames back through a writer task.
async fn serve_connection(stream: TcpStream, engine: Weak<EngineInner>, token: CancellationToken) {
	let (read_half, write_half) = stream.into_split();
	let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
	let (responses, response_rx) = mpsc::channel::<Bytes>(256);
	tokio::spawn(write_responses(write_half, response_rx));

	loop {
		let received = tokio::select! {
			_ = token.cancelled() => break,
			received = reader.next() => received,
		};
		let buf = match received {
			Some(Ok(buf)) => buf.freeze(),
			Some(Err(e)) => {
				warn!("engine connection read failed: {e}");
				break;
			},
			None => break,
		};
		let frame = match Frame::decode(buf) {
			Ok(frame) => frame,
			Err(e) => {
				warn!("dropping malformed engine frame: {e}");
				continue;
			},
		};
		let Some(engine) = engine.upgrade() else { break };
		match frame {
			Frame::Request {
				correlation,
				provider_id,
				rpc_id,
				payload,
			} => {
				let handler = engine
					.handlers
					.read()
					.expect("handler table poisoned")
					.get(&(provider_id, rpc_id))
					.cloned();
				let responses = responses.clone();
				tokio::spawn(async move {
					let result = match handler {
						Some(handler) => handler(rpc_id, payload).await,
						None => Err(Error::Remote(format!(
							"no handler for RPC id {rpc_id} on provider {provider_id}"
						))),
					};
					let frame = Frame::Response {
						correlation,
						result: result.map_err(|e| e.to_string()),
					};
					let _ = responses.send(frame.encode()).await;
				});
			},
			Frame::Identity {
				correlation,
				provider_id,
			} => {
				let identity = engine
					.identities
					.read()
					.expect("identity table poisoned")
					.get(&provider_id)
					.cloned();
				let result = match identity {
					Some(identity) => Ok(Bytes::from(identity)),
					None => Err(format!("no provider registered with id {provider_id}")),
				};
				let frame = Frame::Response {
					correlation,
					result,
				};
				if responses.send(frame.encode()).await.is_err() {
					break;
				}
			},
			Frame::Response { .. } => {
				warn!("unexpected response frame on serving connection");
			},
		}
	}
}

async fn write_responses(write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
	let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
	while let Some(frame) = rx.recv().await {
		if let Err(e) = writer.send(frame).await {
			debug!("engine connection write failed: {e}");
			break;
		}
	}
}

enum Command {
	Call {
		provider_id: u16,
		rpc_id: RpcId,
		payload: Bytes,
		reply: oneshot::Sender<Result<Bytes>>,
	},
	Identity {
		provider_id: u16,
		reply: oneshot::Sender<Result<Bytes>>,
	},
}

/// A connection to a remote engine. Requests are multiplexed over one
/// stream; responses complete out of order through correlation ids.
#[derive(Clone)]
pub struct Endpoint {
	address: Arc<str>,
	commands: mpsc::Sender<Command>,
}

impl Endpoint {
	async fn connect(address: &str) -> Result<Endpoint> {
		let mut attempt = 0;
		let stream = loop {
			match TcpStream::connect(address).await {
				Ok(stream) => break stream,
				Err(e) => {
					attempt += 1;
					if attempt >= CONNECT_ATTEMPTS {
						return Err(Error::Transport(format!("could not connect to {address}: {e}")));
					}
					tokio::time::sleep(CONNECT_BACKOFF).await;
				},
			}
		};
		let (commands, command_rx) = mpsc::channel(256);
		let address: Arc<str> = Arc::from(address);
		tokio::spawn(drive_connection(stream, command_rx, address.clone()));
		Ok(Endpoint { address, commands })
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	/// Invoke an RPC by id on a provider of the remote engine. Suspends
	/// until the response bytes arrive.
	pub async fn call(&self, provider_id: u16, rpc_id: RpcId, payload: Bytes) -> Result<Bytes> {
		let (reply, rx) = oneshot::channel();
		self
			.commands
			.send(Command::Call {
				provider_id,
				rpc_id,
				payload,
				reply,
			})
			.await
			.map_err(|_| Error::Transport(format!("connection to {} closed", self.address)))?;
		rx.await
			.map_err(|_| Error::Transport(format!("connection to {} closed", self.address)))?
	}

	/// Probe the identity string advertised by a provider id.
	pub async fn identity(&self, provider_id: u16) -> Result<String> {
		let (reply, rx) = oneshot::channel();
		self
			.commands
			.send(Command::Identity { provider_id, reply })
			.await
			.map_err(|_| Error::Transport(format!("connection to {} closed", self.address)))?;
		let bytes = rx
			.await
			.map_err(|_| Error::Transport(format!("connection to {} closed", self.address)))??;
		Ok(String::from_utf8_lossy(&bytes).into_owned())
	}
}

impl std::fmt::Debug for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Endpoint")
			.field("address", &self.address)
			.finish_non_exhaustive()
	}
}

async fn drive_connection(stream: TcpStream, mut commands: mpsc::Receiver<Command>, address: Arc<str>) {
	let (read_half, write_half) = stream.into_split();
	let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
	let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
	let mut next_correlation: u64 = 0;
	let mut pending: HashMap<u64, oneshot::Sender<Result<Bytes>>> = HashMap::new();

	loop {
		tokio::select! {
			command = commands.recv() => {
				let Some(command) = command else { break };
				let correlation = next_correlation;
				next_correlation += 1;
				let (frame, reply) = match command {
					Command::Call { provider_id, rpc_id, payload, reply } => (
						Frame::Request { correlation, provider_id, rpc_id, payload },
						reply,
					),
					Command::Identity { provider_id, reply } => (
						Frame::Identity { correlation, provider_id },
						reply,
					),
				};
				if let Err(e) = writer.send(frame.encode()).await {
					let _ = reply.send(Err(Error::Transport(format!("send to {address} failed: {e}"))));
					break;
				}
				pending.insert(correlation, reply);
			},
			received = reader.next() => {
				let buf = match received {
					Some(Ok(buf)) => buf.freeze(),
					Some(Err(e)) => {
						warn!("connection to {address} failed: {e}");
						break;
					},
					None => break,
				};
				match Frame::decode(buf) {
					Ok(Frame::Response { correlation, result }) => match pending.remove(&correlation) {
						Some(reply) => {
							let _ = reply.send(result.map_err(Error::Remote));
						},
						None => debug!(correlation, "dropping response with no pending request"),
					},
					Ok(_) => warn!("unexpected frame on originating connection to {address}"),
					Err(e) => warn!("dropping malformed frame from {address}: {e}"),
				}
			},
		}
	}
	for (_, reply) in pending.drain() {
		let _ = reply.send(Err(Error::Transport(format!("connection to {address} closed"))));
	}
}

/// A resolved `(endpoint, provider id)` pair: the address of one provider on
/// a remote engine.
#[derive(Clone)]
pub struct ProviderHandle {
	pub endpoint: Endpoint,
	pub provider_id: u16,
}

impl ProviderHandle {
	pub fn new(endpoint: Endpoint, provider_id: u16) -> Self {
		ProviderHandle {
			endpoint,
			provider_id,
		}
	}

	pub async fn call(&self, rpc_id: RpcId, payload: Bytes) -> Result<Bytes> {
		self.endpoint.call(self.provider_id, rpc_id, payload).await
	}

	pub async fn identity(&self) -> Result<String> {
		self.endpoint.identity(self.provider_id).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn call_and_identity_round_trip() {
		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		engine.register(
			5,
			"shout",
			handler(|_rpc_id, payload| async move {
				let text = String::from_utf8_lossy(&payload).to_uppercase();
				Ok(Bytes::from(text))
			}),
		);
		engine.set_identity(5, "kage");

		let endpoint = engine.lookup(&engine.address().unwrap()).await.unwrap();
		let rpc = engine.define("shout");
		let output = endpoint
			.call(5, rpc.id, Bytes::from_static(b"hi"))
			.await
			.unwrap();
		assert_eq!(output, Bytes::from_static(b"HI"));

		assert_eq!(endpoint.identity(5).await.unwrap(), "kage");
		assert!(endpoint.identity(6).await.is_err());
		assert!(
			endpoint
				.call(5, engine.define("nope").id, Bytes::new())
				.await
				.is_err()
		);

		engine.finalize().await;
	}

	#[tokio::test]
	async fn concurrent_calls_multiplex_on_one_connection() {
		let engine = Engine::listen("127.0.0.1:0").await.unwrap();
		engine.register(
			1,
			"delay",
			handler(|_rpc_id, payload| async move {
				if payload.starts_with(b"slow") {
					tokio::time::sleep(Duration::from_millis(200)).await;
				}
				Ok(payload)
			}),
		);
		let endpoint = engine.lookup(&engine.address().unwrap()).await.unwrap();
		let rpc_id = engine.define("delay").id;

		let slow = endpoint.call(1, rpc_id, Bytes::from_static(b"slow"));
		let fast = endpoint.call(1, rpc_id, Bytes::from_static(b"fast"));
		let (slow, fast) = tokio::join!(slow, fast);
		assert_eq!(slow.unwrap(), Bytes::from_static(b"slow"));
		assert_eq!(fast.unwrap(), Bytes::from_static(b"fast"));

		engine.finalize().await;
	}
}
