use kage::rpc::Engine;
use kage::{Client, Error, Provider};

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

const PROVIDER_CONFIG: &str = r#"
{
	"exported_rpcs": [],
	"direction": "out",
	"proxy": {
		"type": "echo",
		"config": {}
	}
}
"#;

#[tokio::test]
async fn open_proxy_handles() -> anyhow::Result<()> {
	init_tracing();
	let engine = Engine::listen("127.0.0.1:0").await?;
	let provider = Provider::new(&engine, 42, PROVIDER_CONFIG, None).await?;
	let address = engine.address()?;

	let client = Client::new(&engine);
	let proxy = client.make_proxy_handle(&address, 42, true).await?;
	assert_eq!(proxy.provider_id(), 42);

	// No provider with id 55: the identity check fails, skipping it does not.
	assert!(matches!(
		client.make_proxy_handle(&address, 55, true).await,
		Err(Error::NotAProvider(_))
	));
	assert!(client.make_proxy_handle(&address, 55, false).await.is_ok());

	provider.destroy().await?;
	engine.finalize().await;
	Ok(())
}

#[tokio::test]
async fn identity_mismatch_is_rejected() -> anyhow::Result<()> {
	init_tracing();
	let engine = Engine::listen("127.0.0.1:0").await?;
	// Something else lives at provider id 7.
	engine.set_identity(7, "warabi");

	let client = Client::new(&engine);
	let address = engine.address()?;
	assert!(matches!(
		client.make_proxy_handle(&address, 7, true).await,
		Err(Error::NotAProvider(_))
	));
	assert!(client.make_proxy_handle(&address, 7, false).await.is_ok());

	engine.finalize().await;
	Ok(())
}

#[tokio::test]
async fn unknown_backend_type_fails_construction() -> anyhow::Result<()> {
	init_tracing();
	let engine = Engine::listen("127.0.0.1:0").await?;
	let config = r#"
	{
		"exported_rpcs": ["my_rpc"],
		"direction": "out",
		"proxy": {
			"type": "no-such",
			"config": {}
		}
	}
	"#;
	assert!(matches!(
		Provider::new(&engine, 42, config, None).await,
		Err(Error::UnknownBackend(_))
	));
	engine.finalize().await;
	Ok(())
}
