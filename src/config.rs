use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role of a proxy with respect to its backend: `in` accepts requests from
/// the backend and re-invokes them locally, `out` accepts local RPCs and
/// ships them through the backend, `inout` does both.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
	In,
	Out,
	Inout,
}

impl Direction {
	pub fn is_input(self) -> bool {
		matches!(self, Direction::In | Direction::Inout)
	}

	pub fn is_output(self) -> bool {
		matches!(self, Direction::Out | Direction::Inout)
	}
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ProxySpec {
	#[serde(rename = "type")]
	pub backend_type: String,
	#[serde(default = "empty_object")]
	pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
	serde_json::Value::Object(Default::default())
}

/// Provider configuration, persisted as JSON at the boundary.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ProviderConfig {
	pub direction: Direction,
	pub proxy: ProxySpec,
	pub exported_rpcs: Vec<String>,
}

impl ProviderConfig {
	pub fn from_json(raw: &str) -> Result<Self> {
		let config: ProviderConfig = serde_json::from_str(raw)
			.map_err(|e| Error::Config(format!("could not parse provider configuration: {e}")))?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.proxy.backend_type.is_empty() {
			return Err(Error::config("proxy.type must not be empty"));
		}
		let mut seen = HashSet::new();
		for name in &self.exported_rpcs {
			if name.is_empty() {
				return Err(Error::config("exported RPC names must not be empty"));
			}
			if !seen.insert(name.as_str()) {
				return Err(Error::Config(format!("duplicate exported RPC name {name:?}")));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_full_config() {
		let cfg = ProviderConfig::from_json(
			r#"{
				"direction": "inout",
				"proxy": {"type": "echo", "config": {}},
				"exported_rpcs": ["hello", "goodbye"]
			}"#,
		)
		.unwrap();
		assert_eq!(cfg.direction, Direction::Inout);
		assert!(cfg.direction.is_input());
		assert!(cfg.direction.is_output());
		assert_eq!(cfg.proxy.backend_type, "echo");
		assert_eq!(cfg.exported_rpcs, vec!["hello", "goodbye"]);
	}

	#[test]
	fn backend_config_is_optional() {
		let cfg = ProviderConfig::from_json(
			r#"{"direction": "out", "proxy": {"type": "echo"}, "exported_rpcs": []}"#,
		)
		.unwrap();
		assert!(cfg.proxy.config.is_object());
	}

	#[test]
	fn rejects_missing_keys() {
		for raw in [
			r#"{"proxy": {"type": "echo"}, "exported_rpcs": []}"#,
			r#"{"direction": "out", "exported_rpcs": []}"#,
			r#"{"direction": "out", "proxy": {"type": "echo"}}"#,
			r#"{"direction": "out", "proxy": {}, "exported_rpcs": []}"#,
		] {
			assert!(matches!(ProviderConfig::from_json(raw), Err(Error::Config(_))));
		}
	}

	#[test]
	fn rejects_bad_direction() {
		let raw = r#"{"direction": "sideways", "proxy": {"type": "echo"}, "exported_rpcs": []}"#;
		assert!(matches!(ProviderConfig::from_json(raw), Err(Error::Config(_))));
	}

	#[test]
	fn rejects_empty_and_duplicate_names() {
		let raw = r#"{"direction": "out", "proxy": {"type": "echo"}, "exported_rpcs": [""]}"#;
		assert!(matches!(ProviderConfig::from_json(raw), Err(Error::Config(_))));
		let raw = r#"{"direction": "out", "proxy": {"type": "echo"}, "exported_rpcs": ["a", "a"]}"#;
		assert!(matches!(ProviderConfig::from_json(raw), Err(Error::Config(_))));
	}
}
