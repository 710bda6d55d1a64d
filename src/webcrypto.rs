//! Host cryptographic provider.
//!
//! [`CryptoProvider`] is the capability the sandbox consumes: random bytes,
//! UUIDs and an optional [`SubtleCrypto`] implementation. Any part may be
//! absent; the crypto bridge degrades to VM-side rejections in that case.
//!
//! [`NativeCrypto`] implements the provider on top of `ring` (AES-GCM,
//! ECDSA P-256, PBKDF2, HKDF, RNG) and the RustCrypto `sha1`/`sha2`/`hmac`
//! crates. Secret key material is held in [`Zeroizing`] buffers.

use std::fmt;
use std::num::NonZeroU32;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use ring::aead::{AES_128_GCM, AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    ECDSA_P256_SHA256_FIXED, ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair,
    UnparsedPublicKey,
};
use ring::{hkdf, pbkdf2};
use sha2::Digest;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::marshal::HostValue;

/// DER prefix of a P-256 `SubjectPublicKeyInfo` ahead of the 65-byte point.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
const P256_POINT_LEN: usize = 65;
const AES_GCM_IV_LEN: usize = 12;
/// Largest secret a derive or generate call produces, in bits (64 KiB).
pub const MAX_SECRET_BITS: u32 = 65_536 * 8;

// ============================================================================
// Provider traits
// ============================================================================

/// Capability object injected into a script session.
pub trait CryptoProvider: Send + Sync {
    /// Fill `buf` with cryptographically secure random bytes.
    fn get_random_values(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        let _ = buf;
        Err(CryptoError::unavailable(
            "crypto.getRandomValues is not available (requires WebCrypto)",
        ))
    }

    /// A random RFC 4122 v4 UUID, if the provider has a native generator.
    fn random_uuid(&self) -> Option<String> {
        None
    }

    fn subtle(&self) -> Option<&dyn SubtleCrypto> {
        None
    }
}

/// The `crypto.subtle` operation set.
pub trait SubtleCrypto {
    fn digest(&self, algorithm: &Algorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn encrypt(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn sign(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn verify(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        signature: &[u8],
        data: &[u8],
    ) -> Result<bool, CryptoError>;

    fn generate_key(
        &self,
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<GeneratedKey, CryptoError>;

    fn import_key(
        &self,
        format: KeyFormat,
        key_data: &KeyData,
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<CryptoKey, CryptoError>;

    fn export_key(&self, format: KeyFormat, key: &CryptoKey) -> Result<ExportedKey, CryptoError>;

    fn derive_bits(
        &self,
        algorithm: &Algorithm,
        base_key: &CryptoKey,
        length: u32,
    ) -> Result<Vec<u8>, CryptoError>;

    fn derive_key(
        &self,
        algorithm: &Algorithm,
        base_key: &CryptoKey,
        derived_key_type: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<CryptoKey, CryptoError>;

    fn wrap_key(
        &self,
        format: KeyFormat,
        key: &CryptoKey,
        wrapping_key: &CryptoKey,
        wrap_algorithm: &Algorithm,
    ) -> Result<Vec<u8>, CryptoError>;

    #[allow(clippy::too_many_arguments)]
    fn unwrap_key(
        &self,
        format: KeyFormat,
        wrapped_key: &[u8],
        unwrapping_key: &CryptoKey,
        unwrap_algorithm: &Algorithm,
        unwrapped_key_algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<CryptoKey, CryptoError>;
}

// ============================================================================
// Algorithm descriptors
// ============================================================================

/// A normalized algorithm descriptor: `name` plus the remaining fields, with
/// byte-valued fields already converted to [`HostValue::Bytes`].
#[derive(Debug, Clone, PartialEq)]
pub struct Algorithm {
    pub name: String,
    pub params: IndexMap<String, HostValue>,
}

impl Algorithm {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: HostValue) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// Accepts `"SHA-256"` or `{ name: "AES-GCM", ... }`.
    pub fn from_host(value: &HostValue) -> Result<Self, CryptoError> {
        match value {
            HostValue::String(name) => Ok(Self::named(name.clone())),
            HostValue::Map(map) => {
                let name = map
                    .get("name")
                    .and_then(HostValue::as_str)
                    .ok_or_else(|| CryptoError::data("Algorithm: name is required"))?;
                let params = map
                    .iter()
                    .filter(|(key, _)| key.as_str() != "name")
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                Ok(Self {
                    name: name.to_string(),
                    params,
                })
            }
            _ => Err(CryptoError::data("Algorithm: expected a name or descriptor object")),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn bytes(&self, key: &str) -> Result<Vec<u8>, CryptoError> {
        self.params
            .get(key)
            .and_then(HostValue::to_bytes)
            .ok_or_else(|| CryptoError::data(format!("{}: '{key}' is required", self.name)))
    }

    pub fn opt_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.params.get(key).and_then(HostValue::to_bytes)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(HostValue::as_f64)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(HostValue::as_str)
    }

    /// The `hash` member, given as a name or `{ name }`.
    pub fn hash(&self) -> Result<HashAlg, CryptoError> {
        let hash = self
            .params
            .get("hash")
            .ok_or_else(|| CryptoError::data(format!("{}: 'hash' is required", self.name)))?;
        let name = hash
            .as_str()
            .or_else(|| hash.get("name").and_then(HostValue::as_str))
            .ok_or_else(|| CryptoError::data(format!("{}: invalid 'hash'", self.name)))?;
        HashAlg::parse(name)
    }

    fn length_bits(&self) -> Option<u32> {
        let length = self.number("length")?;
        if length.is_finite() && length >= 0.0 && length <= f64::from(u32::MAX) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let bits = length as u32;
            Some(bits)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_uppercase().as_str() {
            "SHA-1" => Ok(Self::Sha1),
            "SHA-256" => Ok(Self::Sha256),
            "SHA-384" => Ok(Self::Sha384),
            "SHA-512" => Ok(Self::Sha512),
            _ => Err(CryptoError::not_supported(format!(
                "Unrecognized hash algorithm '{name}'"
            ))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Block size in bits; the default HMAC key length.
    pub const fn block_bits(self) -> u32 {
        match self {
            Self::Sha1 | Self::Sha256 => 512,
            Self::Sha384 | Self::Sha512 => 1024,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha384 => sha2::Sha384::digest(data).to_vec(),
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    const fn jwk_hmac_alg(self) -> &'static str {
        match self {
            Self::Sha1 => "HS1",
            Self::Sha256 => "HS256",
            Self::Sha384 => "HS384",
            Self::Sha512 => "HS512",
        }
    }

    fn hkdf(self) -> hkdf::Algorithm {
        match self {
            Self::Sha1 => hkdf::HKDF_SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => hkdf::HKDF_SHA256,
            Self::Sha384 => hkdf::HKDF_SHA384,
            Self::Sha512 => hkdf::HKDF_SHA512,
        }
    }

    fn pbkdf2(self) -> pbkdf2::Algorithm {
        match self {
            Self::Sha1 => pbkdf2::PBKDF2_HMAC_SHA1,
            Self::Sha256 => pbkdf2::PBKDF2_HMAC_SHA256,
            Self::Sha384 => pbkdf2::PBKDF2_HMAC_SHA384,
            Self::Sha512 => pbkdf2::PBKDF2_HMAC_SHA512,
        }
    }
}

macro_rules! hmac_tag {
    ($digest:ty, $key:expr, $data:expr) => {{
        let mut mac = <Hmac<$digest> as Mac>::new_from_slice($key)
            .map_err(|_| CryptoError::data("invalid HMAC key length"))?;
        mac.update($data);
        mac.finalize().into_bytes().to_vec()
    }};
}

macro_rules! hmac_check {
    ($digest:ty, $key:expr, $data:expr, $signature:expr) => {{
        let mut mac = <Hmac<$digest> as Mac>::new_from_slice($key)
            .map_err(|_| CryptoError::data("invalid HMAC key length"))?;
        mac.update($data);
        mac.verify_slice($signature).is_ok()
    }};
}

fn hmac_sign(hash: HashAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(match hash {
        HashAlg::Sha1 => hmac_tag!(sha1::Sha1, key, data),
        HashAlg::Sha256 => hmac_tag!(sha2::Sha256, key, data),
        HashAlg::Sha384 => hmac_tag!(sha2::Sha384, key, data),
        HashAlg::Sha512 => hmac_tag!(sha2::Sha512, key, data),
    })
}

fn hmac_verify(
    hash: HashAlg,
    key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    Ok(match hash {
        HashAlg::Sha1 => hmac_check!(sha1::Sha1, key, data, signature),
        HashAlg::Sha256 => hmac_check!(sha2::Sha256, key, data, signature),
        HashAlg::Sha384 => hmac_check!(sha2::Sha384, key, data, signature),
        HashAlg::Sha512 => hmac_check!(sha2::Sha512, key, data, signature),
    })
}

// ============================================================================
// Keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Secret,
    Public,
    Private,
}

impl KeyType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    DeriveKey,
    DeriveBits,
    WrapKey,
    UnwrapKey,
}

impl KeyUsage {
    const ALL: [Self; 8] = [
        Self::Encrypt,
        Self::Decrypt,
        Self::Sign,
        Self::Verify,
        Self::DeriveKey,
        Self::DeriveBits,
        Self::WrapKey,
        Self::UnwrapKey,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::Verify => "verify",
            Self::DeriveKey => "deriveKey",
            Self::DeriveBits => "deriveBits",
            Self::WrapKey => "wrapKey",
            Self::UnwrapKey => "unwrapKey",
        }
    }

    pub fn parse(usage: &str) -> Result<Self, CryptoError> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == usage)
            .ok_or_else(|| CryptoError::syntax(format!("Unrecognized key usage '{usage}'")))
    }

    /// Parse a usage list, dropping duplicates while keeping order.
    pub fn parse_list<'a>(
        usages: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<Self>, CryptoError> {
        let mut out = Vec::new();
        for usage in usages {
            let usage = Self::parse(usage)?;
            if !out.contains(&usage) {
                out.push(usage);
            }
        }
        Ok(out)
    }
}

/// The `algorithm` dictionary of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Hmac { hash: HashAlg, length: u32 },
    AesGcm { length: u32 },
    EcdsaP256,
    Pbkdf2,
    Hkdf,
}

impl KeyAlgorithm {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hmac { .. } => "HMAC",
            Self::AesGcm { .. } => "AES-GCM",
            Self::EcdsaP256 => "ECDSA",
            Self::Pbkdf2 => "PBKDF2",
            Self::Hkdf => "HKDF",
        }
    }

    pub fn to_host_value(self) -> HostValue {
        let name = ("name", HostValue::string(self.name()));
        match self {
            Self::Hmac { hash, length } => HostValue::map([
                name,
                ("hash", HostValue::map([("name", HostValue::string(hash.name()))])),
                ("length", HostValue::Number(f64::from(length))),
            ]),
            Self::AesGcm { length } => {
                HostValue::map([name, ("length", HostValue::Number(f64::from(length)))])
            }
            Self::EcdsaP256 => HostValue::map([name, ("namedCurve", HostValue::string("P-256"))]),
            Self::Pbkdf2 | Self::Hkdf => HostValue::map([name]),
        }
    }
}

/// Host-only key material; never marshaled into the VM.
pub enum KeyMaterial {
    Secret(Zeroizing<Vec<u8>>),
    EcPrivate {
        pkcs8: Zeroizing<Vec<u8>>,
        public_point: Vec<u8>,
    },
    EcPublic {
        point: Vec<u8>,
    },
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(bytes) => write!(f, "Secret(<{} bytes>)", bytes.len()),
            Self::EcPrivate { .. } => f.write_str("EcPrivate(<redacted>)"),
            Self::EcPublic { point } => write!(f, "EcPublic(<{} bytes>)", point.len()),
        }
    }
}

#[derive(Debug)]
pub struct CryptoKey {
    pub key_type: KeyType,
    pub extractable: bool,
    pub algorithm: KeyAlgorithm,
    pub usages: Vec<KeyUsage>,
    pub material: KeyMaterial,
}

impl CryptoKey {
    pub fn secret(
        algorithm: KeyAlgorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            key_type: KeyType::Secret,
            extractable,
            algorithm,
            usages,
            material: KeyMaterial::Secret(Zeroizing::new(bytes)),
        }
    }

    pub fn has_usage(&self, usage: KeyUsage) -> bool {
        self.usages.contains(&usage)
    }

    pub fn require_usage(&self, usage: KeyUsage) -> Result<(), CryptoError> {
        if self.has_usage(usage) {
            Ok(())
        } else {
            Err(CryptoError::invalid_access(format!(
                "key does not support the '{}' operation",
                usage.as_str()
            )))
        }
    }

    /// The VM-visible handle for this key: metadata plus the registry id.
    pub fn handle(&self, id: &str) -> HostValue {
        HostValue::map([
            ("__keyId", HostValue::string(id)),
            ("type", HostValue::string(self.key_type.as_str())),
            ("extractable", HostValue::Bool(self.extractable)),
            ("algorithm", self.algorithm.to_host_value()),
            (
                "usages",
                HostValue::List(
                    self.usages
                        .iter()
                        .map(|usage| HostValue::string(usage.as_str()))
                        .collect(),
                ),
            ),
        ])
    }

    fn secret_bytes(&self) -> Result<&[u8], CryptoError> {
        match &self.material {
            KeyMaterial::Secret(bytes) => Ok(bytes),
            _ => Err(CryptoError::invalid_access("expected a secret key")),
        }
    }
}

#[derive(Debug)]
pub struct CryptoKeyPair {
    pub public_key: CryptoKey,
    pub private_key: CryptoKey,
}

#[derive(Debug)]
pub enum GeneratedKey {
    Single(CryptoKey),
    Pair(CryptoKeyPair),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Raw,
    Pkcs8,
    Spki,
    Jwk,
}

impl KeyFormat {
    pub fn parse(format: &str) -> Result<Self, CryptoError> {
        match format {
            "raw" => Ok(Self::Raw),
            "pkcs8" => Ok(Self::Pkcs8),
            "spki" => Ok(Self::Spki),
            "jwk" => Ok(Self::Jwk),
            other => Err(CryptoError::not_supported(format!(
                "Unrecognized key format '{other}'"
            ))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Pkcs8 => "pkcs8",
            Self::Spki => "spki",
            Self::Jwk => "jwk",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyData {
    Bytes(Vec<u8>),
    Jwk(IndexMap<String, HostValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportedKey {
    Bytes(Vec<u8>),
    Jwk(HostValue),
}

impl ExportedKey {
    pub fn into_host_value(self) -> HostValue {
        match self {
            Self::Bytes(bytes) => HostValue::Bytes(bytes),
            Self::Jwk(jwk) => jwk,
        }
    }
}

// ============================================================================
// Native provider
// ============================================================================

/// Provider backed by `ring` and the RustCrypto hash crates.
pub struct NativeCrypto {
    rng: SystemRandom,
}

impl Default for NativeCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NativeCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeCrypto")
    }
}

impl NativeCrypto {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    fn random_vec(&self, len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        self.rng
            .fill(bytes.as_mut_slice())
            .map_err(|_| CryptoError::operation("random number generator failed"))?;
        Ok(bytes)
    }

    fn aes_gcm_seal(
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (sealing_key, iv, aad) = aes_gcm_parts(algorithm, key)?;
        let nonce = Nonce::try_assume_unique_for_key(&iv)
            .map_err(|_| CryptoError::operation("invalid AES-GCM iv"))?;
        let mut in_out = data.to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::from(aad.as_slice()), &mut in_out)
            .map_err(|_| CryptoError::operation("AES-GCM encryption failed"))?;
        Ok(in_out)
    }

    fn aes_gcm_open(
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (opening_key, iv, aad) = aes_gcm_parts(algorithm, key)?;
        let nonce = Nonce::try_assume_unique_for_key(&iv)
            .map_err(|_| CryptoError::operation("invalid AES-GCM iv"))?;
        let mut in_out = data.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::from(aad.as_slice()), &mut in_out)
            .map_err(|_| CryptoError::operation("AES-GCM decryption failed"))?;
        Ok(plaintext.to_vec())
    }

    fn ecdsa_pair(&self, pkcs8: &[u8]) -> Result<EcdsaKeyPair, CryptoError> {
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &self.rng)
            .map_err(|e| CryptoError::data(format!("invalid P-256 private key: {e}")))
    }

    fn derive_raw(
        algorithm: &Algorithm,
        base_key: &CryptoKey,
        length: u32,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if length == 0 || length % 8 != 0 {
            return Err(CryptoError::operation(
                "length must be a non-zero multiple of 8",
            ));
        }
        if length > MAX_SECRET_BITS {
            return Err(CryptoError::operation(format!(
                "length {length} exceeds the maximum of {MAX_SECRET_BITS} bits"
            )));
        }
        let secret = base_key.secret_bytes()?;
        let mut out = Zeroizing::new(vec![0u8; (length / 8) as usize]);
        if algorithm.is("PBKDF2") {
            if base_key.algorithm != KeyAlgorithm::Pbkdf2 {
                return Err(key_mismatch("PBKDF2"));
            }
            let salt = algorithm.bytes("salt")?;
            let iterations = algorithm
                .number("iterations")
                .filter(|n| n.is_finite() && *n >= 1.0 && *n <= f64::from(u32::MAX))
                .ok_or_else(|| CryptoError::operation("PBKDF2: iterations must be greater than 0"))?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let iterations = NonZeroU32::new(iterations as u32)
                .ok_or_else(|| CryptoError::operation("PBKDF2: iterations must be greater than 0"))?;
            pbkdf2::derive(algorithm.hash()?.pbkdf2(), iterations, &salt, secret, &mut out);
            return Ok(out);
        }
        if algorithm.is("HKDF") {
            if base_key.algorithm != KeyAlgorithm::Hkdf {
                return Err(key_mismatch("HKDF"));
            }
            let salt = algorithm.bytes("salt")?;
            let info = algorithm.bytes("info")?;
            let prk = hkdf::Salt::new(algorithm.hash()?.hkdf(), &salt).extract(secret);
            let info_parts = [info.as_slice()];
            prk.expand(&info_parts, OutputLen(out.len()))
                .and_then(|okm| okm.fill(&mut out))
                .map_err(|_| CryptoError::operation("HKDF: requested length is too large"))?;
            return Ok(out);
        }
        Err(unsupported(&algorithm.name, "deriveBits"))
    }
}

struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn unsupported(name: &str, operation: &str) -> CryptoError {
    CryptoError::not_supported(format!("Algorithm '{name}' is not supported for {operation}"))
}

fn key_mismatch(name: &str) -> CryptoError {
    CryptoError::invalid_access(format!("key algorithm does not match {name}"))
}

fn check_usages(
    allowed: &[KeyUsage],
    usages: &[KeyUsage],
    require_non_empty: bool,
) -> Result<(), CryptoError> {
    if let Some(bad) = usages.iter().find(|usage| !allowed.contains(usage)) {
        return Err(CryptoError::syntax(format!(
            "Cannot create a key using the specified key usages ('{}')",
            bad.as_str()
        )));
    }
    if require_non_empty && usages.is_empty() {
        return Err(CryptoError::syntax(
            "Usages cannot be empty when creating a key",
        ));
    }
    Ok(())
}

fn aes_gcm_parts(
    algorithm: &Algorithm,
    key: &CryptoKey,
) -> Result<(LessSafeKey, Vec<u8>, Vec<u8>), CryptoError> {
    if !algorithm.is("AES-GCM") {
        return Err(unsupported(&algorithm.name, "encryption"));
    }
    if !matches!(key.algorithm, KeyAlgorithm::AesGcm { .. }) {
        return Err(key_mismatch("AES-GCM"));
    }
    let iv = algorithm.bytes("iv")?;
    if iv.len() != AES_GCM_IV_LEN {
        return Err(CryptoError::not_supported("AES-GCM iv must be 12 bytes"));
    }
    if let Some(tag_length) = algorithm.number("tagLength") {
        if (tag_length - 128.0).abs() > f64::EPSILON {
            return Err(CryptoError::not_supported(
                "AES-GCM tagLength must be 128",
            ));
        }
    }
    let aad = algorithm.opt_bytes("additionalData").unwrap_or_default();
    let secret = key.secret_bytes()?;
    let cipher = match secret.len() {
        16 => &AES_128_GCM,
        32 => &AES_256_GCM,
        _ => return Err(CryptoError::data("invalid AES-GCM key length")),
    };
    let unbound = UnboundKey::new(cipher, secret)
        .map_err(|_| CryptoError::data("invalid AES-GCM key"))?;
    Ok((LessSafeKey::new(unbound), iv, aad))
}

fn aes_key_length(bits: u32) -> Result<u32, CryptoError> {
    match bits {
        128 | 256 => Ok(bits),
        192 => Err(CryptoError::not_supported(
            "AES-GCM 192-bit keys are not supported",
        )),
        _ => Err(CryptoError::data("AES key length must be 128 or 256 bits")),
    }
}

fn require_p256(algorithm: &Algorithm) -> Result<(), CryptoError> {
    match algorithm.string("namedCurve") {
        Some("P-256") => Ok(()),
        Some(other) => Err(CryptoError::not_supported(format!(
            "ECDSA curve '{other}' is not supported"
        ))),
        None => Err(CryptoError::data("ECDSA: 'namedCurve' is required")),
    }
}

fn secret_key_bytes(
    format: KeyFormat,
    key_data: &KeyData,
    name: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match (format, key_data) {
        (KeyFormat::Raw, KeyData::Bytes(bytes)) => Ok(Zeroizing::new(bytes.clone())),
        (KeyFormat::Jwk, KeyData::Jwk(jwk)) => decode_oct_jwk(jwk),
        (KeyFormat::Raw | KeyFormat::Jwk, _) => {
            Err(CryptoError::data("key data does not match the key format"))
        }
        (other, _) => Err(CryptoError::not_supported(format!(
            "'{}' format is not supported for {name} keys",
            other.as_str()
        ))),
    }
}

fn decode_oct_jwk(jwk: &IndexMap<String, HostValue>) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if jwk.get("kty").and_then(HostValue::as_str) != Some("oct") {
        return Err(CryptoError::data("JWK 'kty' must be 'oct'"));
    }
    let k = jwk
        .get("k")
        .and_then(HostValue::as_str)
        .ok_or_else(|| CryptoError::data("JWK 'k' is required"))?;
    URL_SAFE_NO_PAD
        .decode(k.trim_end_matches('='))
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::data(format!("JWK 'k' is not valid base64url: {e}")))
}

fn encode_oct_jwk(key: &CryptoKey, secret: &[u8]) -> Result<HostValue, CryptoError> {
    let alg = match key.algorithm {
        KeyAlgorithm::Hmac { hash, .. } => hash.jwk_hmac_alg(),
        KeyAlgorithm::AesGcm { length: 128 } => "A128GCM",
        KeyAlgorithm::AesGcm { .. } => "A256GCM",
        other => {
            return Err(CryptoError::not_supported(format!(
                "'jwk' format is not supported for {} keys",
                other.name()
            )));
        }
    };
    Ok(HostValue::map([
        ("kty", HostValue::string("oct")),
        ("k", HostValue::string(URL_SAFE_NO_PAD.encode(secret))),
        ("alg", HostValue::string(alg)),
        ("ext", HostValue::Bool(key.extractable)),
        (
            "key_ops",
            HostValue::List(
                key.usages
                    .iter()
                    .map(|usage| HostValue::string(usage.as_str()))
                    .collect(),
            ),
        ),
    ]))
}

fn usages_for(usages: &[KeyUsage], wanted: KeyUsage) -> Vec<KeyUsage> {
    usages.iter().copied().filter(|u| *u == wanted).collect()
}

impl CryptoProvider for NativeCrypto {
    fn get_random_values(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.rng
            .fill(buf)
            .map_err(|_| CryptoError::operation("random number generator failed"))
    }

    fn random_uuid(&self) -> Option<String> {
        Some(uuid::Uuid::new_v4().to_string())
    }

    fn subtle(&self) -> Option<&dyn SubtleCrypto> {
        Some(self)
    }
}

impl SubtleCrypto for NativeCrypto {
    fn digest(&self, algorithm: &Algorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let hash = HashAlg::parse(&algorithm.name)
            .map_err(|_| unsupported(&algorithm.name, "digest"))?;
        Ok(hash.digest(data))
    }

    fn encrypt(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        key.require_usage(KeyUsage::Encrypt)?;
        Self::aes_gcm_seal(algorithm, key, data)
    }

    fn decrypt(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        key.require_usage(KeyUsage::Decrypt)?;
        Self::aes_gcm_open(algorithm, key, data)
    }

    fn sign(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if algorithm.is("HMAC") {
            let KeyAlgorithm::Hmac { hash, .. } = key.algorithm else {
                return Err(key_mismatch("HMAC"));
            };
            key.require_usage(KeyUsage::Sign)?;
            return hmac_sign(hash, key.secret_bytes()?, data);
        }
        if algorithm.is("ECDSA") {
            if algorithm.hash()? != HashAlg::Sha256 {
                return Err(CryptoError::not_supported("ECDSA supports SHA-256 only"));
            }
            let KeyMaterial::EcPrivate { pkcs8, .. } = &key.material else {
                return Err(CryptoError::invalid_access("ECDSA signing requires a private key"));
            };
            key.require_usage(KeyUsage::Sign)?;
            let signature = self
                .ecdsa_pair(pkcs8)?
                .sign(&self.rng, data)
                .map_err(|_| CryptoError::operation("ECDSA signing failed"))?;
            return Ok(signature.as_ref().to_vec());
        }
        Err(unsupported(&algorithm.name, "sign"))
    }

    fn verify(
        &self,
        algorithm: &Algorithm,
        key: &CryptoKey,
        signature: &[u8],
        data: &[u8],
    ) -> Result<bool, CryptoError> {
        if algorithm.is("HMAC") {
            let KeyAlgorithm::Hmac { hash, .. } = key.algorithm else {
                return Err(key_mismatch("HMAC"));
            };
            key.require_usage(KeyUsage::Verify)?;
            return hmac_verify(hash, key.secret_bytes()?, data, signature);
        }
        if algorithm.is("ECDSA") {
            if algorithm.hash()? != HashAlg::Sha256 {
                return Err(CryptoError::not_supported("ECDSA supports SHA-256 only"));
            }
            let KeyMaterial::EcPublic { point } = &key.material else {
                return Err(CryptoError::invalid_access(
                    "ECDSA verification requires a public key",
                ));
            };
            key.require_usage(KeyUsage::Verify)?;
            let public_key = UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point);
            return Ok(public_key.verify(data, signature).is_ok());
        }
        Err(unsupported(&algorithm.name, "verify"))
    }

    fn generate_key(
        &self,
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<GeneratedKey, CryptoError> {
        if algorithm.is("HMAC") {
            check_usages(&[KeyUsage::Sign, KeyUsage::Verify], usages, true)?;
            let hash = algorithm.hash()?;
            let length = algorithm.length_bits().unwrap_or_else(|| hash.block_bits());
            if length == 0 || length % 8 != 0 {
                return Err(CryptoError::data(
                    "HMAC key length must be a non-zero multiple of 8",
                ));
            }
            if length > MAX_SECRET_BITS {
                return Err(CryptoError::data(format!(
                    "HMAC key length {length} exceeds the maximum of {MAX_SECRET_BITS} bits"
                )));
            }
            let bytes = self.random_vec((length / 8) as usize)?;
            return Ok(GeneratedKey::Single(CryptoKey::secret(
                KeyAlgorithm::Hmac { hash, length },
                extractable,
                usages.to_vec(),
                bytes.to_vec(),
            )));
        }
        if algorithm.is("AES-GCM") {
            check_usages(
                &[
                    KeyUsage::Encrypt,
                    KeyUsage::Decrypt,
                    KeyUsage::WrapKey,
                    KeyUsage::UnwrapKey,
                ],
                usages,
                true,
            )?;
            let length = aes_key_length(
                algorithm
                    .length_bits()
                    .ok_or_else(|| CryptoError::data("AES-GCM: 'length' is required"))?,
            )?;
            let bytes = self.random_vec((length / 8) as usize)?;
            return Ok(GeneratedKey::Single(CryptoKey::secret(
                KeyAlgorithm::AesGcm { length },
                extractable,
                usages.to_vec(),
                bytes.to_vec(),
            )));
        }
        if algorithm.is("ECDSA") {
            require_p256(algorithm)?;
            check_usages(&[KeyUsage::Sign, KeyUsage::Verify], usages, false)?;
            let private_usages = usages_for(usages, KeyUsage::Sign);
            check_usages(&[KeyUsage::Sign], &private_usages, true)?;
            let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &self.rng)
                .map_err(|_| CryptoError::operation("ECDSA key generation failed"))?;
            let public_point = self.ecdsa_pair(pkcs8.as_ref())?.public_key().as_ref().to_vec();
            return Ok(GeneratedKey::Pair(CryptoKeyPair {
                public_key: CryptoKey {
                    key_type: KeyType::Public,
                    extractable: true,
                    algorithm: KeyAlgorithm::EcdsaP256,
                    usages: usages_for(usages, KeyUsage::Verify),
                    material: KeyMaterial::EcPublic {
                        point: public_point.clone(),
                    },
                },
                private_key: CryptoKey {
                    key_type: KeyType::Private,
                    extractable,
                    algorithm: KeyAlgorithm::EcdsaP256,
                    usages: private_usages,
                    material: KeyMaterial::EcPrivate {
                        pkcs8: Zeroizing::new(pkcs8.as_ref().to_vec()),
                        public_point,
                    },
                },
            }));
        }
        Err(unsupported(&algorithm.name, "generateKey"))
    }

    fn import_key(
        &self,
        format: KeyFormat,
        key_data: &KeyData,
        algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<CryptoKey, CryptoError> {
        if algorithm.is("HMAC") {
            check_usages(&[KeyUsage::Sign, KeyUsage::Verify], usages, true)?;
            let hash = algorithm.hash()?;
            let bytes = secret_key_bytes(format, key_data, "HMAC")?;
            if bytes.is_empty() {
                return Err(CryptoError::data("HMAC key data must not be empty"));
            }
            let length = u32::try_from(bytes.len() * 8)
                .map_err(|_| CryptoError::data("HMAC key data is too large"))?;
            return Ok(CryptoKey::secret(
                KeyAlgorithm::Hmac { hash, length },
                extractable,
                usages.to_vec(),
                bytes.to_vec(),
            ));
        }
        if algorithm.is("AES-GCM") {
            check_usages(
                &[
                    KeyUsage::Encrypt,
                    KeyUsage::Decrypt,
                    KeyUsage::WrapKey,
                    KeyUsage::UnwrapKey,
                ],
                usages,
                true,
            )?;
            let bytes = secret_key_bytes(format, key_data, "AES-GCM")?;
            let length = u32::try_from(bytes.len() * 8)
                .map_err(|_| CryptoError::data("AES key data is too large"))?;
            let length = aes_key_length(length)?;
            return Ok(CryptoKey::secret(
                KeyAlgorithm::AesGcm { length },
                extractable,
                usages.to_vec(),
                bytes.to_vec(),
            ));
        }
        if algorithm.is("ECDSA") {
            require_p256(algorithm)?;
            let KeyData::Bytes(bytes) = key_data else {
                return Err(CryptoError::not_supported(
                    "'jwk' format is not supported for ECDSA keys",
                ));
            };
            return match format {
                KeyFormat::Raw | KeyFormat::Spki => {
                    check_usages(&[KeyUsage::Verify], usages, false)?;
                    let point = if format == KeyFormat::Spki {
                        bytes
                            .strip_prefix(P256_SPKI_PREFIX.as_slice())
                            .ok_or_else(|| CryptoError::data("invalid P-256 SubjectPublicKeyInfo"))?
                    } else {
                        bytes.as_slice()
                    };
                    if point.len() != P256_POINT_LEN || point[0] != 0x04 {
                        return Err(CryptoError::data(
                            "P-256 public key must be an uncompressed point",
                        ));
                    }
                    Ok(CryptoKey {
                        key_type: KeyType::Public,
                        extractable: true,
                        algorithm: KeyAlgorithm::EcdsaP256,
                        usages: usages.to_vec(),
                        material: KeyMaterial::EcPublic {
                            point: point.to_vec(),
                        },
                    })
                }
                KeyFormat::Pkcs8 => {
                    check_usages(&[KeyUsage::Sign], usages, true)?;
                    let public_point = self.ecdsa_pair(bytes)?.public_key().as_ref().to_vec();
                    Ok(CryptoKey {
                        key_type: KeyType::Private,
                        extractable,
                        algorithm: KeyAlgorithm::EcdsaP256,
                        usages: usages.to_vec(),
                        material: KeyMaterial::EcPrivate {
                            pkcs8: Zeroizing::new(bytes.clone()),
                            public_point,
                        },
                    })
                }
                KeyFormat::Jwk => Err(CryptoError::not_supported(
                    "'jwk' format is not supported for ECDSA keys",
                )),
            };
        }
        if algorithm.is("PBKDF2") || algorithm.is("HKDF") {
            check_usages(&[KeyUsage::DeriveKey, KeyUsage::DeriveBits], usages, true)?;
            let (KeyFormat::Raw, KeyData::Bytes(bytes)) = (format, key_data) else {
                return Err(CryptoError::not_supported(format!(
                    "'{}' format is not supported for {} keys",
                    format.as_str(),
                    algorithm.name
                )));
            };
            let key_algorithm = if algorithm.is("PBKDF2") {
                KeyAlgorithm::Pbkdf2
            } else {
                KeyAlgorithm::Hkdf
            };
            return Ok(CryptoKey::secret(
                key_algorithm,
                false,
                usages.to_vec(),
                bytes.clone(),
            ));
        }
        Err(unsupported(&algorithm.name, "importKey"))
    }

    fn export_key(&self, format: KeyFormat, key: &CryptoKey) -> Result<ExportedKey, CryptoError> {
        if !key.extractable {
            return Err(CryptoError::invalid_access("key is not extractable"));
        }
        let exported = match (&key.material, key.algorithm, format) {
            (
                KeyMaterial::Secret(bytes),
                KeyAlgorithm::Hmac { .. } | KeyAlgorithm::AesGcm { .. },
                KeyFormat::Raw,
            ) => ExportedKey::Bytes(bytes.to_vec()),
            (KeyMaterial::Secret(bytes), _, KeyFormat::Jwk) => {
                ExportedKey::Jwk(encode_oct_jwk(key, bytes)?)
            }
            (KeyMaterial::EcPublic { point }, _, KeyFormat::Raw) => {
                ExportedKey::Bytes(point.clone())
            }
            (KeyMaterial::EcPublic { point }, _, KeyFormat::Spki) => {
                let mut spki = P256_SPKI_PREFIX.to_vec();
                spki.extend_from_slice(point);
                ExportedKey::Bytes(spki)
            }
            (KeyMaterial::EcPrivate { pkcs8, .. }, _, KeyFormat::Pkcs8) => {
                ExportedKey::Bytes(pkcs8.to_vec())
            }
            _ => {
                return Err(CryptoError::not_supported(format!(
                    "Cannot export {} {} key in '{}' format",
                    key.algorithm.name(),
                    key.key_type.as_str(),
                    format.as_str()
                )));
            }
        };
        Ok(exported)
    }

    fn derive_bits(
        &self,
        algorithm: &Algorithm,
        base_key: &CryptoKey,
        length: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        base_key.require_usage(KeyUsage::DeriveBits)?;
        Ok(Self::derive_raw(algorithm, base_key, length)?.to_vec())
    }

    fn derive_key(
        &self,
        algorithm: &Algorithm,
        base_key: &CryptoKey,
        derived_key_type: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<CryptoKey, CryptoError> {
        base_key.require_usage(KeyUsage::DeriveKey)?;
        let length = if derived_key_type.is("AES-GCM") {
            aes_key_length(
                derived_key_type
                    .length_bits()
                    .ok_or_else(|| CryptoError::data("AES-GCM: 'length' is required"))?,
            )?
        } else if derived_key_type.is("HMAC") {
            match derived_key_type.length_bits() {
                Some(length) => length,
                None => derived_key_type.hash()?.block_bits(),
            }
        } else {
            return Err(unsupported(&derived_key_type.name, "deriveKey"));
        };
        let raw = Self::derive_raw(algorithm, base_key, length)?;
        self.import_key(
            KeyFormat::Raw,
            &KeyData::Bytes(raw.to_vec()),
            derived_key_type,
            extractable,
            usages,
        )
    }

    fn wrap_key(
        &self,
        format: KeyFormat,
        key: &CryptoKey,
        wrapping_key: &CryptoKey,
        wrap_algorithm: &Algorithm,
    ) -> Result<Vec<u8>, CryptoError> {
        wrapping_key.require_usage(KeyUsage::WrapKey)?;
        let plaintext = match self.export_key(format, key)? {
            ExportedKey::Bytes(bytes) => Zeroizing::new(bytes),
            ExportedKey::Jwk(jwk) => Zeroizing::new(
                serde_json::to_vec(&jwk)
                    .map_err(|e| CryptoError::operation(format!("failed to encode JWK: {e}")))?,
            ),
        };
        Self::aes_gcm_seal(wrap_algorithm, wrapping_key, &plaintext)
    }

    fn unwrap_key(
        &self,
        format: KeyFormat,
        wrapped_key: &[u8],
        unwrapping_key: &CryptoKey,
        unwrap_algorithm: &Algorithm,
        unwrapped_key_algorithm: &Algorithm,
        extractable: bool,
        usages: &[KeyUsage],
    ) -> Result<CryptoKey, CryptoError> {
        unwrapping_key.require_usage(KeyUsage::UnwrapKey)?;
        let plaintext = Zeroizing::new(Self::aes_gcm_open(
            unwrap_algorithm,
            unwrapping_key,
            wrapped_key,
        )?);
        let key_data = if format == KeyFormat::Jwk {
            let json: serde_json::Value = serde_json::from_slice(&plaintext)
                .map_err(|e| CryptoError::data(format!("unwrapped JWK is not valid JSON: {e}")))?;
            match HostValue::from_json(&json) {
                HostValue::Map(map) => KeyData::Jwk(map),
                _ => return Err(CryptoError::data("unwrapped JWK must be an object")),
            }
        } else {
            KeyData::Bytes(plaintext.to_vec())
        };
        self.import_key(
            format,
            &key_data,
            unwrapped_key_algorithm,
            extractable,
            usages,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        use std::fmt::Write as _;
        bytes.iter().fold(String::new(), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    fn unhex(text: &str) -> Vec<u8> {
        (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16).expect("hex"))
            .collect()
    }

    fn crypto() -> NativeCrypto {
        NativeCrypto::new()
    }

    fn usages(list: &[&str]) -> Vec<KeyUsage> {
        KeyUsage::parse_list(list.iter().copied()).expect("usages")
    }

    fn aes_key(extractable: bool, list: &[&str]) -> CryptoKey {
        let generated = crypto()
            .generate_key(
                &Algorithm::named("AES-GCM").with("length", HostValue::Number(256.0)),
                extractable,
                &usages(list),
            )
            .expect("generate AES key");
        match generated {
            GeneratedKey::Single(key) => key,
            GeneratedKey::Pair(_) => panic!("expected single key"),
        }
    }

    fn gcm(iv: &[u8]) -> Algorithm {
        Algorithm::named("AES-GCM").with("iv", HostValue::Bytes(iv.to_vec()))
    }

    #[test]
    fn digest_known_answers() {
        let c = crypto();
        assert_eq!(
            hex(&c.digest(&Algorithm::named("SHA-256"), b"abc").unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex(&c.digest(&Algorithm::named("sha-1"), b"abc").unwrap()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(c.digest(&Algorithm::named("SHA-512"), b"").unwrap().len(), 64);
        let err = c.digest(&Algorithm::named("MD5"), b"abc").unwrap_err();
        assert!(err.message.starts_with("NotSupportedError"));
    }

    #[test]
    fn hmac_rfc4231_case_2() {
        let c = crypto();
        let key = c
            .import_key(
                KeyFormat::Raw,
                &KeyData::Bytes(b"Jefe".to_vec()),
                &Algorithm::named("HMAC").with("hash", HostValue::string("SHA-256")),
                true,
                &usages(&["sign", "verify"]),
            )
            .unwrap();
        let tag = c
            .sign(&Algorithm::named("HMAC"), &key, b"what do ya want for nothing?")
            .unwrap();
        assert_eq!(
            hex(&tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(c.verify(&Algorithm::named("HMAC"), &key, &tag, b"what do ya want for nothing?").unwrap());
        assert!(!c.verify(&Algorithm::named("HMAC"), &key, &tag, b"tampered").unwrap());
        assert_eq!(
            key.algorithm,
            KeyAlgorithm::Hmac {
                hash: HashAlg::Sha256,
                length: 32
            }
        );
    }

    #[test]
    fn hmac_generate_defaults_to_block_size_and_exports_jwk() {
        let c = crypto();
        let GeneratedKey::Single(key) = c
            .generate_key(
                &Algorithm::named("HMAC").with(
                    "hash",
                    HostValue::map([("name", HostValue::string("SHA-512"))]),
                ),
                true,
                &usages(&["sign"]),
            )
            .unwrap()
        else {
            panic!("expected single key");
        };
        assert_eq!(
            key.algorithm,
            KeyAlgorithm::Hmac {
                hash: HashAlg::Sha512,
                length: 1024
            }
        );
        let ExportedKey::Jwk(jwk) = c.export_key(KeyFormat::Jwk, &key).unwrap() else {
            panic!("expected jwk");
        };
        assert_eq!(jwk.get("kty"), Some(&HostValue::string("oct")));
        assert_eq!(jwk.get("alg"), Some(&HostValue::string("HS512")));

        let HostValue::Map(map) = jwk else {
            panic!("jwk map");
        };
        let reimported = c
            .import_key(
                KeyFormat::Jwk,
                &KeyData::Jwk(map),
                &Algorithm::named("HMAC").with("hash", HostValue::string("SHA-512")),
                false,
                &usages(&["sign"]),
            )
            .unwrap();
        let a = c.sign(&Algorithm::named("HMAC"), &key, b"m").unwrap();
        let b = c.sign(&Algorithm::named("HMAC"), &reimported, b"m").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn aes_gcm_round_trip_and_tamper_detection() {
        let c = crypto();
        let key = aes_key(false, &["encrypt", "decrypt"]);
        let alg = gcm(&[7u8; 12]).with("additionalData", HostValue::Bytes(b"hdr".to_vec()));
        let sealed = c.encrypt(&alg, &key, b"secret message").unwrap();
        assert_eq!(sealed.len(), b"secret message".len() + 16);
        assert_eq!(c.decrypt(&alg, &key, &sealed).unwrap(), b"secret message");

        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        let err = c.decrypt(&alg, &key, &tampered).unwrap_err();
        assert!(err.message.starts_with("OperationError"));
    }

    #[test]
    fn aes_gcm_rejects_short_iv_and_192_bit_keys() {
        let c = crypto();
        let key = aes_key(false, &["encrypt"]);
        let err = c.encrypt(&gcm(&[0u8; 8]), &key, b"x").unwrap_err();
        assert!(err.message.contains("12 bytes"));

        let err = c
            .generate_key(
                &Algorithm::named("AES-GCM").with("length", HostValue::Number(192.0)),
                false,
                &usages(&["encrypt"]),
            )
            .unwrap_err();
        assert!(err.message.starts_with("NotSupportedError"));
    }

    #[test]
    fn usage_and_extractable_checks() {
        let c = crypto();
        let key = aes_key(false, &["encrypt"]);
        let err = c.decrypt(&gcm(&[0u8; 12]), &key, &[0u8; 32]).unwrap_err();
        assert!(err.message.starts_with("InvalidAccessError"));
        let err = c.export_key(KeyFormat::Raw, &key).unwrap_err();
        assert_eq!(err.message, "InvalidAccessError: key is not extractable");

        let err = c
            .generate_key(
                &Algorithm::named("AES-GCM").with("length", HostValue::Number(128.0)),
                true,
                &usages(&["sign"]),
            )
            .unwrap_err();
        assert!(err.message.starts_with("SyntaxError"));
    }

    #[test]
    fn ecdsa_sign_verify_and_spki_round_trip() {
        let c = crypto();
        let alg = Algorithm::named("ECDSA").with("namedCurve", HostValue::string("P-256"));
        let GeneratedKey::Pair(pair) = c
            .generate_key(&alg, false, &usages(&["sign", "verify"]))
            .unwrap()
        else {
            panic!("expected key pair");
        };
        assert_eq!(pair.private_key.usages, vec![KeyUsage::Sign]);
        assert_eq!(pair.public_key.usages, vec![KeyUsage::Verify]);
        assert!(pair.public_key.extractable);

        let sign_alg = Algorithm::named("ECDSA").with("hash", HostValue::string("SHA-256"));
        let signature = c.sign(&sign_alg, &pair.private_key, b"payload").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(c.verify(&sign_alg, &pair.public_key, &signature, b"payload").unwrap());

        let ExportedKey::Bytes(spki) = c.export_key(KeyFormat::Spki, &pair.public_key).unwrap()
        else {
            panic!("expected bytes");
        };
        assert_eq!(spki.len(), 91);
        let imported = c
            .import_key(KeyFormat::Spki, &KeyData::Bytes(spki), &alg, true, &usages(&["verify"]))
            .unwrap();
        assert!(c.verify(&sign_alg, &imported, &signature, b"payload").unwrap());
        assert!(!c.verify(&sign_alg, &imported, &signature, b"other").unwrap());

        let err = c.export_key(KeyFormat::Pkcs8, &pair.private_key).unwrap_err();
        assert!(err.message.contains("not extractable"));
    }

    #[test]
    fn pbkdf2_rfc6070_vector() {
        let c = crypto();
        let key = c
            .import_key(
                KeyFormat::Raw,
                &KeyData::Bytes(b"password".to_vec()),
                &Algorithm::named("PBKDF2"),
                false,
                &usages(&["deriveBits"]),
            )
            .unwrap();
        let alg = Algorithm::named("PBKDF2")
            .with("salt", HostValue::Bytes(b"salt".to_vec()))
            .with("iterations", HostValue::Number(1.0))
            .with("hash", HostValue::string("SHA-1"));
        let bits = c.derive_bits(&alg, &key, 160).unwrap();
        assert_eq!(hex(&bits), "0c60c80f961f0e71f3a9b524af6012062fe037a6");
    }

    #[test]
    fn oversized_secrets_are_rejected_before_allocation() {
        let c = crypto();
        let key = c
            .import_key(
                KeyFormat::Raw,
                &KeyData::Bytes(b"password".to_vec()),
                &Algorithm::named("PBKDF2"),
                false,
                &usages(&["deriveBits"]),
            )
            .unwrap();
        let alg = Algorithm::named("PBKDF2")
            .with("salt", HostValue::Bytes(b"salt".to_vec()))
            .with("iterations", HostValue::Number(1.0))
            .with("hash", HostValue::string("SHA-256"));
        let err = c.derive_bits(&alg, &key, 256 * 1024 * 1024 * 8).unwrap_err();
        assert!(err.message.contains("exceeds the maximum"), "{}", err.message);
        assert_eq!(c.derive_bits(&alg, &key, MAX_SECRET_BITS).unwrap().len(), 65_536);

        let hmac = Algorithm::named("HMAC")
            .with("hash", HostValue::string("SHA-256"))
            .with("length", HostValue::Number(f64::from(u32::MAX - 7)));
        let err = c
            .generate_key(&hmac, false, &usages(&["sign"]))
            .err()
            .expect("oversized HMAC key");
        assert!(err.message.contains("exceeds the maximum"), "{}", err.message);
    }

    #[test]
    fn hkdf_rfc5869_case_1() {
        let c = crypto();
        let key = c
            .import_key(
                KeyFormat::Raw,
                &KeyData::Bytes(vec![0x0b; 22]),
                &Algorithm::named("HKDF"),
                false,
                &usages(&["deriveBits"]),
            )
            .unwrap();
        let alg = Algorithm::named("HKDF")
            .with("salt", HostValue::Bytes(unhex("000102030405060708090a0b0c")))
            .with("info", HostValue::Bytes(unhex("f0f1f2f3f4f5f6f7f8f9")))
            .with("hash", HostValue::string("SHA-256"));
        let bits = c.derive_bits(&alg, &key, 42 * 8).unwrap();
        assert_eq!(
            hex(&bits),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn derive_key_produces_usable_aes_key() {
        let c = crypto();
        let base = c
            .import_key(
                KeyFormat::Raw,
                &KeyData::Bytes(b"pw".to_vec()),
                &Algorithm::named("PBKDF2"),
                false,
                &usages(&["deriveKey"]),
            )
            .unwrap();
        let alg = Algorithm::named("PBKDF2")
            .with("salt", HostValue::Bytes(vec![1; 16]))
            .with("iterations", HostValue::Number(10.0))
            .with("hash", HostValue::string("SHA-256"));
        let derived = c
            .derive_key(
                &alg,
                &base,
                &Algorithm::named("AES-GCM").with("length", HostValue::Number(128.0)),
                false,
                &usages(&["encrypt", "decrypt"]),
            )
            .unwrap();
        assert_eq!(derived.algorithm, KeyAlgorithm::AesGcm { length: 128 });
        let sealed = c.encrypt(&gcm(&[1; 12]), &derived, b"hi").unwrap();
        assert_eq!(c.decrypt(&gcm(&[1; 12]), &derived, &sealed).unwrap(), b"hi");

        let err = c.derive_bits(&alg, &base, 128).unwrap_err();
        assert!(err.message.starts_with("InvalidAccessError"));
    }

    #[test]
    fn wrap_and_unwrap_jwk() {
        let c = crypto();
        let wrapping = aes_key(false, &["wrapKey", "unwrapKey"]);
        let inner = aes_key(true, &["encrypt", "decrypt"]);
        let wrapped = c
            .wrap_key(KeyFormat::Jwk, &inner, &wrapping, &gcm(&[9; 12]))
            .unwrap();
        let unwrapped = c
            .unwrap_key(
                KeyFormat::Jwk,
                &wrapped,
                &wrapping,
                &gcm(&[9; 12]),
                &Algorithm::named("AES-GCM"),
                true,
                &usages(&["encrypt", "decrypt"]),
            )
            .unwrap();
        assert_eq!(
            c.export_key(KeyFormat::Raw, &unwrapped).unwrap(),
            c.export_key(KeyFormat::Raw, &inner).unwrap()
        );
    }

    #[test]
    fn handles_never_carry_key_material() {
        let key = aes_key(true, &["encrypt"]);
        let handle = key.handle("abc");
        let HostValue::Map(map) = &handle else {
            panic!("handle map");
        };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["__keyId", "type", "extractable", "algorithm", "usages"]);
        assert_eq!(
            handle.get("algorithm").and_then(|a| a.get("name")),
            Some(&HostValue::string("AES-GCM"))
        );
        assert!(format!("{key:?}").contains("<32 bytes>"));
    }

    #[test]
    fn unsupported_algorithms_report_not_supported() {
        let c = crypto();
        let err = c
            .generate_key(&Algorithm::named("RSA-OAEP"), false, &usages(&["encrypt"]))
            .unwrap_err();
        assert_eq!(
            err.message,
            "NotSupportedError: Algorithm 'RSA-OAEP' is not supported for generateKey"
        );
    }
}
