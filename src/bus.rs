//! Duplex pub/sub sockets over TCP. An address containing `*` binds (a
//! bound pub socket fans out to every connected subscriber, a bound sub
//! socket fans in from every connected publisher), otherwise it connects.
//! The subscription filter is receive-all. As with the bus this models,
//! frames published before a subscriber is connected are dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::{Error, Result};

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const CHANNEL_DEPTH: usize = 1024;

fn parse_address(address: &str) -> Result<(bool, String)> {
	let Some(rest) = address.strip_prefix("tcp://") else {
		return Err(Error::Config(format!(
			"unsupported bus address {address:?} (expected tcp://host:port)"
		)));
	};
	if rest.contains('*') {
		Ok((true, rest.replace('*', "0.0.0.0")))
	} else {
		Ok((false, rest.to_string()))
	}
}

async fn connect_with_retry(host: &str, address: &str) -> Result<TcpStream> {
	let mut attempt = 0;
	loop {
		match TcpStream::connect(host).await {
			Ok(stream) => return Ok(stream),
			Err(e) => {
				attempt += 1;
				if attempt >= CONNECT_ATTEMPTS {
					return Err(Error::Transport(format!("could not connect to {address}: {e}")));
				}
				tokio::time::sleep(CONNECT_BACKOFF).await;
			},
		}
	}
}

/// Publishing side of the bus. Cloning shares the socket.
#[derive(Clone)]
pub struct PubSocket {
	inner: Arc<PubInner>,
}

struct PubInner {
	address: String,
	subscribers: Mutex<Vec<mpsc::Sender<Bytes>>>,
	token: CancellationToken,
}

impl Drop for PubInner {
	fn drop(&mut self) {
		self.token.cancel();
	}
}

impl PubSocket {
	pub async fn open(address: &str) -> Result<PubSocket> {
		let (bind, host) = parse_address(address)?;
		let inner = Arc::new(PubInner {
			address: address.to_string(),
			subscribers: Mutex::new(Vec::new()),
			token: CancellationToken::new(),
		});
		if bind {
			let listener = TcpListener::bind(&host)
				.await
				.map_err(|e| Error::Transport(format!("could not bind {address}: {e}")))?;
			tokio::spawn(accept_subscribers(
				listener,
				Arc::downgrade(&inner),
				inner.token.clone(),
			));
		} else {
			let stream = connect_with_retry(&host, address).await?;
			let writer = spawn_writer(stream, inner.token.clone());
			inner.subscribers.lock().await.push(writer);
		}
		trace!(address, bind, "opened pub socket");
		Ok(PubSocket { inner })
	}

	pub fn address(&self) -> &str {
		&self.inner.address
	}

	/// Publish one frame to every connected subscriber. A subscriber whose
	/// queue is full loses the frame; a disconnected one is pruned.
	pub async fn send(&self, frame: Bytes) -> Result<()> {
		let mut subscribers = self.inner.subscribers.lock().await;
		subscribers.retain(|writer| match writer.try_send(frame.clone()) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(address = %self.inner.address, "slow subscriber, dropping frame");
				true
			},
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		});
		if subscribers.is_empty() {
			trace!(address = %self.inner.address, "published frame with no subscriber connected");
		}
		Ok(())
	}

	pub fn close(&self) {
		self.inner.token.cancel();
	}
}

async fn accept_subscribers(listener: TcpListener, inner: Weak<PubInner>, token: CancellationToken) {
	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					let Some(inner) = inner.upgrade() else { break };
					trace!(%peer, "subscriber connected");
					let writer = spawn_writer(stream, token.clone());
					inner.subscribers.lock().await.push(writer);
				},
				Err(e) => warn!("accept on pub socket failed: {e}"),
			},
		}
	}
}

fn spawn_writer(stream: TcpStream, token: CancellationToken) -> mpsc::Sender<Bytes> {
	let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
	tokio::spawn(async move {
		let mut writer = FramedWrite::new(stream, LengthDelimitedCodec::new());
		loop {
			let frame = tokio::select! {
				_ = token.cancelled() => break,
				frame = rx.recv() => match frame {
					Some(frame) => frame,
					None => break,
				},
			};
			if let Err(e) = writer.send(frame).await {
				trace!("subscriber connection lost: {e}");
				break;
			}
		}
	});
	tx
}

/// Subscribing side of the bus. Owned by whoever drains it.
pub struct SubSocket {
	address: String,
	frames: mpsc::Receiver<Bytes>,
	token: CancellationToken,
}

impl Drop for SubSocket {
	fn drop(&mut self) {
		self.token.cancel();
	}
}

impl SubSocket {
	pub async fn open(address: &str) -> Result<SubSocket> {
		let (bind, host) = parse_address(address)?;
		let (tx, frames) = mpsc::channel(CHANNEL_DEPTH);
		let token = CancellationToken::new();
		if bind {
			let listener = TcpListener::bind(&host)
				.await
				.map_err(|e| Error::Transport(format!("could not bind {address}: {e}")))?;
			tokio::spawn(accept_publishers(listener, tx, token.clone()));
		} else {
			let stream = connect_with_retry(&host, address).await?;
			tokio::spawn(read_frames(stream, tx, token.clone()));
		}
		trace!(address, bind, "opened sub socket");
		Ok(SubSocket {
			address: address.to_string(),
			frames,
			token,
		})
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	/// Next frame from any connected publisher; `None` once closed.
	pub async fn recv(&mut self) -> Option<Bytes> {
		self.frames.recv().await
	}

	pub fn close(&self) {
		self.token.cancel();
	}
}

async fn accept_publishers(listener: TcpListener, tx: mpsc::Sender<Bytes>, token: CancellationToken) {
	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					trace!(%peer, "publisher connected");
					tokio::spawn(read_frames(stream, tx.clone(), token.clone()));
				},
				Err(e) => warn!("accept on sub socket failed: {e}"),
			},
		}
	}
}

async fn read_frames(stream: TcpStream, tx: mpsc::Sender<Bytes>, token: CancellationToken) {
	let mut reader = FramedRead::new(stream, LengthDelimitedCodec::new());
	loop {
		let received = tokio::select! {
			_ = token.cancelled() => break,
			received = reader.next() => received,
		};
		match received {
			Some(Ok(frame)) => {
				if tx.send(frame.freeze()).await.is_err() {
					break;
				}
			},
			Some(Err(e)) => {
				warn!("bus read failed: {e}");
				break;
			},
			None => break,
		}
	}
}
