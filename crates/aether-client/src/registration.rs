//! Registration / root-server selection interface (`spec.md` §2 C11, §4.9,
//! supplemented). `spec.md` only specifies this at interface level; this
//! module implements the *shapes* from `original_source/aether/registration/`
//! and §6's "Registration handshake" as a [`RootServerClient`] trait plus a
//! [`register`] orchestration function, keeping the actual cryptographic
//! handshake behind a collaborator-trait boundary the same way
//! `wind-tuic`'s `tls::tls_config` keeps `rustls` behind a thin adapter
//! rather than hand-rolling TLS.

use aether_api::work_cloud::ServerDescriptor;
use aether_core::types::{AddressPort, ClientConfig, Endpoint, ServerConfig, Uid};
use futures::future::BoxFuture;

use crate::error::{ClientResult, RegistrationSnafu};

/// The signed asymmetric public key returned by `get_asymmetric_public_key`
/// (`spec.md` §6 step 1).
#[derive(Debug, Clone)]
pub struct SignedPublicKey {
	pub key: Vec<u8>,
	pub signature: Vec<u8>,
}

/// Arguments for the `registration(...)` sub-API call (`spec.md` §6 step 2).
/// `encrypted_inner`'s `set_master_key`/`finish()` pair is not modeled here —
/// producing and sealing it is the concrete [`RootServerClient`]
/// implementation's job, using an [`AsymmetricCryptoProvider`]/
/// [`SymmetricCryptoProvider`] pair behind the scenes.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
	pub salt: Vec<u8>,
	pub password_suffix: String,
	pub passwords: Vec<String>,
	pub parent_uid: Uid,
}

/// What `encrypted_inner`'s `finish()` hands back (`spec.md` §6 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
	pub ephemeral_uid: Uid,
	pub uid: Uid,
	pub cloud_server_ids: Vec<u32>,
}

/// Root-server surface the registration handshake drives (`spec.md` §6
/// "Registration handshake"). Left as a trait rather than a concrete client
/// so the transport and crypto framing underneath it stay swappable.
pub trait RootServerClient: Send + Sync {
	fn get_asymmetric_public_key(&self) -> BoxFuture<'_, ClientResult<SignedPublicKey>>;

	/// `request` is wrapped as the sub-API call, `encrypted_inner`'s
	/// `set_master_key(master_key)` is sent alongside it, both encrypted for
	/// the key `get_asymmetric_public_key` returned (`spec.md` §6 step 2).
	fn registration(&self, request: RegistrationRequest, server_key: &SignedPublicKey, master_key: &[u8]) -> BoxFuture<'_, ClientResult<RegistrationOutcome>>;

	/// Resolves the registration outcome's cloud into concrete endpoints
	/// (`spec.md` §6 step 3).
	fn resolve_servers(&self, server_ids: &[u32]) -> BoxFuture<'_, ClientResult<Vec<ServerDescriptor>>>;
}

/// Verifies a root server's signed key (`spec.md` §6: "Ed25519 or Hydrogen
/// Signature").
pub trait SignatureProvider: Send + Sync {
	fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Seals a payload for a peer's asymmetric public key (`spec.md` §6:
/// "Sodium Box-seal ... or Hydrogen CryptoPK"). Used by concrete
/// [`RootServerClient`] implementations to build the encrypted `registration`
/// call; the orchestration function below doesn't need it directly.
pub trait AsymmetricCryptoProvider: Send + Sync {
	fn seal(&self, plaintext: &[u8], public_key: &[u8]) -> Vec<u8>;
}

/// Seals a payload with an already-agreed symmetric key (`spec.md` §6:
/// "ChaCha20-Poly1305 or Hydrogen SecretBox"). Used the same way as
/// [`AsymmetricCryptoProvider`], for `encrypted_inner`.
pub trait SymmetricCryptoProvider: Send + Sync {
	fn seal(&self, plaintext: &[u8], key: &[u8]) -> Vec<u8>;
}

/// Drives the four-step handshake `spec.md` §6 describes end to end,
/// producing the [`ClientConfig`] the server-connection manager (C9) is
/// built from.
pub async fn register(root: &dyn RootServerClient, signature: &dyn SignatureProvider, request: RegistrationRequest, master_key: Vec<u8>) -> ClientResult<ClientConfig> {
	let parent_uid = request.parent_uid;

	let server_key = root.get_asymmetric_public_key().await?;
	if !signature.verify(&server_key.key, &server_key.signature, &server_key.key) {
		return RegistrationSnafu {
			step: "get_asymmetric_public_key",
			reason: "root server's signed key did not verify".to_string(),
		}
		.fail();
	}

	let outcome = root.registration(request, &server_key, &master_key).await?;

	let descriptors = root.resolve_servers(&outcome.cloud_server_ids).await?;
	let cloud = descriptors.into_iter().map(|descriptor| ServerConfig {
		server_id: descriptor.server_id,
		endpoints: descriptor_endpoints(&descriptor),
	});

	Ok(ClientConfig {
		parent_uid,
		uid: outcome.uid,
		ephemeral_uid: outcome.ephemeral_uid,
		master_key,
		cloud: cloud.collect(),
	})
}

fn descriptor_endpoints(descriptor: &ServerDescriptor) -> Vec<Endpoint> {
	descriptor
		.ips
		.iter()
		.flat_map(|ip| {
			ip.protocol_and_ports.iter().map(move |coder| Endpoint {
				address_port: AddressPort { address: ip.ip.clone(), port: coder.port },
				protocol: coder.protocol,
			})
		})
		.collect()
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use aether_api::work_cloud::{CoderAndPort, IpAddressAndPort};
	use aether_core::types::{Address, Protocol};

	use super::*;

	struct FakeRoot;
	impl RootServerClient for FakeRoot {
		fn get_asymmetric_public_key(&self) -> BoxFuture<'_, ClientResult<SignedPublicKey>> {
			Box::pin(async { Ok(SignedPublicKey { key: vec![1, 2, 3], signature: vec![9] }) })
		}

		fn registration(&self, request: RegistrationRequest, _server_key: &SignedPublicKey, _master_key: &[u8]) -> BoxFuture<'_, ClientResult<RegistrationOutcome>> {
			let parent_uid = request.parent_uid;
			Box::pin(async move {
				Ok(RegistrationOutcome {
					ephemeral_uid: Uid::from_bytes([1u8; 16]),
					uid: if parent_uid == Uid::ZERO { Uid::from_bytes([2u8; 16]) } else { parent_uid },
					cloud_server_ids: vec![7],
				})
			})
		}

		fn resolve_servers(&self, _server_ids: &[u32]) -> BoxFuture<'_, ClientResult<Vec<ServerDescriptor>>> {
			Box::pin(async {
				Ok(vec![ServerDescriptor {
					server_id: 7,
					ips: vec![IpAddressAndPort {
						ip: Address::IPv4(Ipv4Addr::LOCALHOST),
						protocol_and_ports: vec![CoderAndPort { protocol: Protocol::Tcp, port: 9443 }],
					}],
				}])
			})
		}
	}

	struct AlwaysTrustSignature;
	impl SignatureProvider for AlwaysTrustSignature {
		fn verify(&self, _message: &[u8], _signature: &[u8], _public_key: &[u8]) -> bool {
			true
		}
	}

	struct AlwaysDistrustSignature;
	impl SignatureProvider for AlwaysDistrustSignature {
		fn verify(&self, _message: &[u8], _signature: &[u8], _public_key: &[u8]) -> bool {
			false
		}
	}

	fn request() -> RegistrationRequest {
		RegistrationRequest {
			salt: vec![0; 16],
			password_suffix: "suffix".to_string(),
			passwords: vec!["hunter2".to_string()],
			parent_uid: Uid::ZERO,
		}
	}

	#[tokio::test]
	async fn register_assembles_a_client_config_from_the_handshake() {
		let config = register(&FakeRoot, &AlwaysTrustSignature, request(), vec![7u8; 32]).await.unwrap();

		assert_eq!(config.uid, Uid::from_bytes([2u8; 16]));
		assert_eq!(config.ephemeral_uid, Uid::from_bytes([1u8; 16]));
		assert_eq!(config.cloud.len(), 1);
		assert_eq!(config.cloud[0].server_id, 7);
		assert_eq!(config.cloud[0].endpoints[0].address_port.port, 9443);
	}

	#[tokio::test]
	async fn register_rejects_an_unverifiable_root_key() {
		let err = register(&FakeRoot, &AlwaysDistrustSignature, request(), vec![7u8; 32]).await.unwrap_err();
		assert!(matches!(err, crate::error::ClientError::Registration { .. }));
	}
}
