use crate::rpc::RpcId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by providers, backends and the client surface.
///
/// Construction-time errors (`Config`, `UnknownBackend`, `Io`) are fatal and
/// propagate out of the constructor; data-plane errors are returned to the
/// originator of the affected call and never tear a provider down.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Config(String),
	#[error("unknown backend type {0}")]
	UnknownBackend(String),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("unknown RPC id {0}")]
	UnknownRpc(RpcId),
	#[error("input proxy is no longer valid")]
	StaleProxy,
	#[error("provider is not active")]
	ProviderInactive,
	#[error("{0} does not point to a kage provider")]
	NotAProvider(String),
	#[error("remote error: {0}")]
	Remote(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	pub(crate) fn config(err: impl std::fmt::Display) -> Self {
		Error::Config(err.to_string())
	}

	pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
		Error::Transport(err.to_string())
	}
}
