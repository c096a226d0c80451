use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;

use crate::address::PluginAddress;
use crate::error::{Error, Result};

/// A connected byte stream, plain or TLS.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// TLS settings for the plugin channel.
#[derive(Clone)]
pub struct TlsConfig {
	pub client_config: Arc<rustls::ClientConfig>,
	/// Defaults to the TCP host, or `localhost` for Unix sockets.
	pub server_name: Option<String>,
}

impl TlsConfig {
	pub fn new(client_config: Arc<rustls::ClientConfig>) -> Self {
		Self {
			client_config,
			server_name: None,
		}
	}

	pub fn server_name(mut self, name: impl Into<String>) -> Self {
		self.server_name = Some(name.into());
		self
	}
}

impl std::fmt::Debug for TlsConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TlsConfig")
			.field("server_name", &self.server_name)
			.finish_non_exhaustive()
	}
}

pub async fn connect(address: &PluginAddress, tls: Option<&TlsConfig>) -> Result<Box<dyn Transport>> {
	let stream: Box<dyn Transport> = match address {
		PluginAddress::Tcp { family, host, port } => {
			let candidates: Vec<_> = tokio::net::lookup_host((host.as_str(), *port))
				.await
				.map_err(|e| Error::RpcFailed(format!("resolve {}: {}", address, e)))?
				.filter(|addr| family.admits(addr))
				.collect();
			let mut last_err = None;
			let mut connected = None;
			for candidate in candidates {
				match TcpStream::connect(candidate).await {
					Ok(stream) => {
						connected = Some(stream);
						break;
					}
					Err(e) => last_err = Some(e),
				}
			}
			let stream = connected.ok_or_else(|| {
				Error::RpcFailed(match last_err {
					Some(e) => format!("dial {}: {}", address, e),
					None => format!("dial {}: no usable address", address),
				})
			})?;
			let _ = stream.set_nodelay(true);
			Box::new(stream)
		}
		PluginAddress::Unix(path) => Box::new(
			UnixStream::connect(path)
				.await
				.map_err(|e| Error::RpcFailed(format!("dial {}: {}", address, e)))?,
		),
	};

	let Some(tls) = tls else {
		return Ok(stream);
	};
	let name = tls
		.server_name
		.clone()
		.or_else(|| address.host().map(str::to_string))
		.unwrap_or_else(|| "localhost".to_string());
	let server_name =
		ServerName::try_from(name.clone()).map_err(|e| Error::RpcFailed(format!("tls server name {}: {}", name, e)))?;
	let connector = TlsConnector::from(Arc::clone(&tls.client_config));
	let stream = connector
		.connect(server_name, stream)
		.await
		.map_err(|e| Error::RpcFailed(format!("tls handshake with {}: {}", address, e)))?;
	Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
	use super::*;
	use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio_rustls::TlsAcceptor;

	#[tokio::test]
	async fn connects_over_tcp_and_unix() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = PluginAddress::tcp(listener.local_addr().unwrap());
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			stream.write_all(b"tcp").await.unwrap();
		});
		let mut stream = connect(&addr, None).await.unwrap();
		let mut buf = String::new();
		stream.read_to_string(&mut buf).await.unwrap();
		assert_eq!(buf, "tcp");

		let path = std::env::temp_dir().join(format!("tether-transport-{}.sock", std::process::id()));
		let _ = std::fs::remove_file(&path);
		let listener = tokio::net::UnixListener::bind(&path).unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			stream.write_all(b"unix").await.unwrap();
		});
		let mut stream = connect(&PluginAddress::Unix(path.clone()), None).await.unwrap();
		let mut buf = String::new();
		stream.read_to_string(&mut buf).await.unwrap();
		assert_eq!(buf, "unix");
		let _ = std::fs::remove_file(&path);
	}

	// --- TLS ---

	const CA: &[u8] = include_bytes!("../../tests/fixtures/ca.der");
	const LOCALHOST_CERT: &[u8] = include_bytes!("../../tests/fixtures/localhost.der");
	const LOCALHOST_KEY: &[u8] = include_bytes!("../../tests/fixtures/localhost.key.der");

	fn provider() -> Arc<rustls::crypto::CryptoProvider> {
		Arc::new(rustls::crypto::ring::default_provider())
	}

	fn client_tls() -> TlsConfig {
		let mut roots = rustls::RootCertStore::empty();
		roots.add(CertificateDer::from(CA)).unwrap();
		let config = rustls::ClientConfig::builder_with_provider(provider())
			.with_safe_default_protocol_versions()
			.unwrap()
			.with_root_certificates(roots)
			.with_no_client_auth();
		TlsConfig::new(Arc::new(config))
	}

	fn acceptor() -> TlsAcceptor {
		let config = rustls::ServerConfig::builder_with_provider(provider())
			.with_safe_default_protocol_versions()
			.unwrap()
			.with_no_client_auth()
			.with_single_cert(
				vec![CertificateDer::from(LOCALHOST_CERT)],
				PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(LOCALHOST_KEY)),
			)
			.unwrap();
		TlsAcceptor::from(Arc::new(config))
	}

	/// Completes the server side of the handshake and greets the client.
	async fn greet<S: AsyncRead + AsyncWrite + Unpin>(acceptor: TlsAcceptor, stream: S) {
		if let Ok(mut tls) = acceptor.accept(stream).await {
			let _ = tls.write_all(b"tls").await;
			let _ = tls.shutdown().await;
		}
	}

	async fn tls_tcp_listener() -> PluginAddress {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = PluginAddress::tcp(listener.local_addr().unwrap());
		let acceptor = acceptor();
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			greet(acceptor, stream).await;
		});
		addr
	}

	async fn read_greeting(stream: &mut Box<dyn Transport>) -> String {
		let mut buf = [0u8; 3];
		stream.read_exact(&mut buf).await.unwrap();
		String::from_utf8_lossy(&buf).into_owned()
	}

	#[tokio::test]
	async fn tls_over_tcp_defaults_the_server_name_to_the_host() {
		let addr = tls_tcp_listener().await;
		let mut stream = connect(&addr, Some(&client_tls())).await.unwrap();
		assert_eq!(read_greeting(&mut stream).await, "tls");
	}

	#[tokio::test]
	async fn tls_honors_an_explicit_server_name() {
		let addr = tls_tcp_listener().await;
		let tls = client_tls().server_name("localhost");
		let mut stream = connect(&addr, Some(&tls)).await.unwrap();
		assert_eq!(read_greeting(&mut stream).await, "tls");
	}

	#[tokio::test]
	async fn tls_over_unix_falls_back_to_localhost() {
		let path = std::env::temp_dir().join(format!("tether-tls-{}.sock", std::process::id()));
		let _ = std::fs::remove_file(&path);
		let listener = tokio::net::UnixListener::bind(&path).unwrap();
		let acceptor = acceptor();
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			greet(acceptor, stream).await;
		});

		let mut stream = connect(&PluginAddress::Unix(path.clone()), Some(&client_tls())).await.unwrap();
		assert_eq!(read_greeting(&mut stream).await, "tls");
		let _ = std::fs::remove_file(&path);
	}

	#[tokio::test]
	async fn tls_with_the_wrong_server_name_fails() {
		let addr = tls_tcp_listener().await;
		let tls = client_tls().server_name("plugin.example");
		match connect(&addr, Some(&tls)).await {
			Err(Error::RpcFailed(msg)) => assert!(msg.contains("tls handshake"), "{}", msg),
			Err(other) => panic!("expected RpcFailed, got {}", other),
			Ok(_) => panic!("handshake with a mismatched name succeeded"),
		}
	}

	#[tokio::test]
	async fn refused_dial_is_rpc_failure() {
		let addr = crate::address::random_listener_address().unwrap();
		assert!(matches!(connect(&addr, None).await, Err(Error::RpcFailed(_))));
	}
}
