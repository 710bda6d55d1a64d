//! The `crypto` global.
//!
//! `getRandomValues` and `randomUUID` run synchronously against the host
//! provider. Every `crypto.subtle.*` method returns a VM Promise: arguments
//! are marshaled to host values, resolved into a [`SubtleCall`] (keys looked
//! up by `__keyId` in the session registry) and queued on the keepalive
//! tracker. The runner settles queued calls through [`CryptoBridge::settle`],
//! which resolves the Promise with marshaled output or rejects it with an
//! Error named `CryptoError`.
//!
//! Argument problems never throw synchronously; they become rejections.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::function::{Opt, Rest};
use rquickjs::prelude::Func;
use rquickjs::{Ctx, Exception, Function, Object, Promise, Value};

use crate::error::{CryptoError, CryptoErrorKind};
use crate::keepalive::KeepaliveTracker;
use crate::key_registry::{KeyRegistry, RegisteredKey};
use crate::marshal::{HostValue, format_number, to_host, to_vm};
use crate::webcrypto::{
    Algorithm, CryptoKey, CryptoKeyPair, CryptoProvider, ExportedKey, GeneratedKey, KeyData,
    KeyFormat, KeyUsage, SubtleCrypto,
};

/// Upper bound on bytes filled by one `getRandomValues` call.
pub const MAX_RANDOM_VALUES_BYTES: usize = 65_536;

/// Algorithm members that carry binary data.
const BYTE_FIELDS: [&str; 7] = [
    "iv",
    "counter",
    "salt",
    "additionalData",
    "label",
    "info",
    "publicExponent",
];

const CRYPTO_BRIDGE_JS: &str = r"
(function () {
    const pending = new Map();
    globalThis.__hopp_crypto_error = function (message) {
        const error = new Error(String(message));
        error.name = 'CryptoError';
        return error;
    };
    globalThis.__hopp_register_op = function (id, resolve, reject) {
        pending.set(id, { resolve, reject });
    };
    globalThis.__hopp_settle_op = function (id, ok, payload) {
        const entry = pending.get(id);
        if (!entry) {
            return false;
        }
        pending.delete(id);
        if (ok) {
            entry.resolve(payload);
        } else {
            entry.reject(globalThis.__hopp_crypto_error(payload));
        }
        return true;
    };
})();
";

pub type CryptoTracker = Rc<RefCell<KeepaliveTracker<SubtleCall>>>;

// ============================================================================
// Subtle calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtleMethod {
    Digest,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    GenerateKey,
    ImportKey,
    ExportKey,
    DeriveBits,
    DeriveKey,
    WrapKey,
    UnwrapKey,
}

impl SubtleMethod {
    pub const ALL: [Self; 12] = [
        Self::Digest,
        Self::Encrypt,
        Self::Decrypt,
        Self::Sign,
        Self::Verify,
        Self::GenerateKey,
        Self::ImportKey,
        Self::ExportKey,
        Self::DeriveBits,
        Self::DeriveKey,
        Self::WrapKey,
        Self::UnwrapKey,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Digest => "digest",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::Verify => "verify",
            Self::GenerateKey => "generateKey",
            Self::ImportKey => "importKey",
            Self::ExportKey => "exportKey",
            Self::DeriveBits => "deriveBits",
            Self::DeriveKey => "deriveKey",
            Self::WrapKey => "wrapKey",
            Self::UnwrapKey => "unwrapKey",
        }
    }

    /// Positions of required arguments and the message used when one is
    /// missing.
    const fn required(self) -> (&'static [usize], &'static str) {
        match self {
            Self::Digest => (&[1], "digest requires data argument"),
            Self::Encrypt => (&[1, 2], "encrypt requires algorithm, key, and data arguments"),
            Self::Decrypt => (&[1, 2], "decrypt requires algorithm, key, and data arguments"),
            Self::Sign => (&[1, 2], "sign requires algorithm, key, and data arguments"),
            Self::Verify => (
                &[1, 2, 3],
                "verify requires algorithm, key, signature, and data arguments",
            ),
            Self::GenerateKey => (
                &[0, 1, 2],
                "generateKey requires algorithm, extractable, and keyUsages arguments",
            ),
            Self::ImportKey => (
                &[0, 1, 2, 3, 4],
                "importKey requires format, keyData, algorithm, extractable, and keyUsages arguments",
            ),
            Self::ExportKey => (&[0, 1], "exportKey requires format and key arguments"),
            Self::DeriveBits => (
                &[0, 1, 2],
                "deriveBits requires algorithm, key, and length arguments",
            ),
            Self::DeriveKey => (
                &[0, 1, 2, 3, 4],
                "deriveKey requires algorithm, baseKey, derivedKeyType, extractable, and keyUsages arguments",
            ),
            Self::WrapKey => (
                &[0, 1, 2, 3],
                "wrapKey requires format, key, wrappingKey, and wrapAlgorithm arguments",
            ),
            Self::UnwrapKey => (
                &[0, 1, 2, 3, 4, 5, 6],
                "unwrapKey requires all arguments: format, wrappedKey, unwrappingKey, unwrapAlgorithm, unwrappedKeyAlgorithm, extractable, keyUsages",
            ),
        }
    }
}

/// A fully resolved subtle operation waiting to run on the host.
#[derive(Debug)]
pub enum SubtleCall {
    Digest {
        algorithm: Algorithm,
        data: Vec<u8>,
    },
    Encrypt {
        algorithm: Algorithm,
        key: Rc<CryptoKey>,
        data: Vec<u8>,
    },
    Decrypt {
        algorithm: Algorithm,
        key: Rc<CryptoKey>,
        data: Vec<u8>,
    },
    Sign {
        algorithm: Algorithm,
        key: Rc<CryptoKey>,
        data: Vec<u8>,
    },
    Verify {
        algorithm: Algorithm,
        key: Rc<CryptoKey>,
        signature: Vec<u8>,
        data: Vec<u8>,
    },
    GenerateKey {
        algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    },
    ImportKey {
        format: KeyFormat,
        key_data: KeyData,
        algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    },
    ExportKey {
        format: KeyFormat,
        key: Rc<CryptoKey>,
    },
    DeriveBits {
        algorithm: Algorithm,
        key: Rc<CryptoKey>,
        length: u32,
    },
    DeriveKey {
        algorithm: Algorithm,
        key: Rc<CryptoKey>,
        derived_key_type: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    },
    WrapKey {
        format: KeyFormat,
        key: Rc<CryptoKey>,
        wrapping_key: Rc<CryptoKey>,
        algorithm: Algorithm,
    },
    UnwrapKey {
        format: KeyFormat,
        wrapped_key: Vec<u8>,
        unwrapping_key: Rc<CryptoKey>,
        algorithm: Algorithm,
        unwrapped_key_algorithm: Algorithm,
        extractable: bool,
        usages: Vec<KeyUsage>,
    },
    /// Argument resolution failed; settles as a rejection.
    Failed {
        method: SubtleMethod,
        error: CryptoError,
    },
}

impl SubtleCall {
    pub const fn method(&self) -> SubtleMethod {
        match self {
            Self::Digest { .. } => SubtleMethod::Digest,
            Self::Encrypt { .. } => SubtleMethod::Encrypt,
            Self::Decrypt { .. } => SubtleMethod::Decrypt,
            Self::Sign { .. } => SubtleMethod::Sign,
            Self::Verify { .. } => SubtleMethod::Verify,
            Self::GenerateKey { .. } => SubtleMethod::GenerateKey,
            Self::ImportKey { .. } => SubtleMethod::ImportKey,
            Self::ExportKey { .. } => SubtleMethod::ExportKey,
            Self::DeriveBits { .. } => SubtleMethod::DeriveBits,
            Self::DeriveKey { .. } => SubtleMethod::DeriveKey,
            Self::WrapKey { .. } => SubtleMethod::WrapKey,
            Self::UnwrapKey { .. } => SubtleMethod::UnwrapKey,
            Self::Failed { method, .. } => *method,
        }
    }
}

enum SubtleOutput {
    Bytes(Vec<u8>),
    Bool(bool),
    Key(CryptoKey),
    Pair(CryptoKeyPair),
    Exported(ExportedKey),
}

fn execute(subtle: &dyn SubtleCrypto, call: SubtleCall) -> Result<SubtleOutput, CryptoError> {
    match call {
        SubtleCall::Digest { algorithm, data } => {
            subtle.digest(&algorithm, &data).map(SubtleOutput::Bytes)
        }
        SubtleCall::Encrypt {
            algorithm,
            key,
            data,
        } => subtle.encrypt(&algorithm, &key, &data).map(SubtleOutput::Bytes),
        SubtleCall::Decrypt {
            algorithm,
            key,
            data,
        } => subtle.decrypt(&algorithm, &key, &data).map(SubtleOutput::Bytes),
        SubtleCall::Sign {
            algorithm,
            key,
            data,
        } => subtle.sign(&algorithm, &key, &data).map(SubtleOutput::Bytes),
        SubtleCall::Verify {
            algorithm,
            key,
            signature,
            data,
        } => subtle
            .verify(&algorithm, &key, &signature, &data)
            .map(SubtleOutput::Bool),
        SubtleCall::GenerateKey {
            algorithm,
            extractable,
            usages,
        } => subtle
            .generate_key(&algorithm, extractable, &usages)
            .map(|generated| match generated {
                GeneratedKey::Single(key) => SubtleOutput::Key(key),
                GeneratedKey::Pair(pair) => SubtleOutput::Pair(pair),
            }),
        SubtleCall::ImportKey {
            format,
            key_data,
            algorithm,
            extractable,
            usages,
        } => subtle
            .import_key(format, &key_data, &algorithm, extractable, &usages)
            .map(SubtleOutput::Key),
        SubtleCall::ExportKey { format, key } => {
            subtle.export_key(format, &key).map(SubtleOutput::Exported)
        }
        SubtleCall::DeriveBits {
            algorithm,
            key,
            length,
        } => subtle
            .derive_bits(&algorithm, &key, length)
            .map(SubtleOutput::Bytes),
        SubtleCall::DeriveKey {
            algorithm,
            key,
            derived_key_type,
            extractable,
            usages,
        } => subtle
            .derive_key(&algorithm, &key, &derived_key_type, extractable, &usages)
            .map(SubtleOutput::Key),
        SubtleCall::WrapKey {
            format,
            key,
            wrapping_key,
            algorithm,
        } => subtle
            .wrap_key(format, &key, &wrapping_key, &algorithm)
            .map(SubtleOutput::Bytes),
        SubtleCall::UnwrapKey {
            format,
            wrapped_key,
            unwrapping_key,
            algorithm,
            unwrapped_key_algorithm,
            extractable,
            usages,
        } => subtle
            .unwrap_key(
                format,
                &wrapped_key,
                &unwrapping_key,
                &algorithm,
                &unwrapped_key_algorithm,
                extractable,
                &usages,
            )
            .map(SubtleOutput::Key),
        SubtleCall::Failed { error, .. } => Err(error),
    }
}

// ============================================================================
// Argument resolution
// ============================================================================

/// Convert byte-typed algorithm members from plain arrays into bytes.
pub fn normalize_algorithm(value: &HostValue) -> HostValue {
    let HostValue::Map(map) = value else {
        return value.clone();
    };
    let normalized = map
        .iter()
        .map(|(key, item)| {
            let item = match item {
                HostValue::List(_) if BYTE_FIELDS.contains(&key.as_str()) => {
                    item.to_bytes().map_or_else(|| item.clone(), HostValue::Bytes)
                }
                _ => item.clone(),
            };
            (key.clone(), item)
        })
        .collect();
    HostValue::Map(normalized)
}

fn algorithm_arg(value: &HostValue) -> Result<Algorithm, CryptoError> {
    Algorithm::from_host(&normalize_algorithm(value))
}

fn bytes_arg(value: &HostValue, name: &str) -> Result<Vec<u8>, CryptoError> {
    value
        .to_bytes()
        .ok_or_else(|| CryptoError::data(format!("'{name}' must be a byte array or buffer")))
}

fn format_arg(value: &HostValue) -> Result<KeyFormat, CryptoError> {
    value
        .as_str()
        .ok_or_else(|| CryptoError::data("key format must be a string"))
        .and_then(KeyFormat::parse)
}

fn usages_arg(value: &HostValue) -> Result<Vec<KeyUsage>, CryptoError> {
    let HostValue::List(items) = value else {
        return Err(CryptoError::syntax("keyUsages must be an array"));
    };
    let names = items
        .iter()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| CryptoError::syntax("keyUsages must contain strings"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    KeyUsage::parse_list(names)
}

fn truthy(value: &HostValue) -> bool {
    match value {
        HostValue::Undefined | HostValue::Null => false,
        HostValue::Bool(b) => *b,
        HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
        HostValue::String(s) => !s.is_empty(),
        HostValue::Bytes(_) | HostValue::List(_) | HostValue::Map(_) => true,
    }
}

fn key_data_arg(format: KeyFormat, value: &HostValue) -> Result<KeyData, CryptoError> {
    match (format, value) {
        (KeyFormat::Jwk, HostValue::Map(map)) => Ok(KeyData::Jwk(map.clone())),
        (KeyFormat::Jwk, _) => Err(CryptoError::data("JWK key data must be an object")),
        _ => bytes_arg(value, "keyData").map(KeyData::Bytes),
    }
}

fn length_arg(value: &HostValue) -> Result<u32, CryptoError> {
    value
        .as_f64()
        .filter(|n| n.is_finite() && *n >= 0.0 && *n <= f64::from(u32::MAX))
        .map(|n| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let bits = n as u32;
            bits
        })
        .ok_or_else(|| CryptoError::operation("length must be a non-negative number"))
}

/// Resolve marshaled arguments into a host call.
pub fn resolve_call(
    registry: &RefCell<KeyRegistry>,
    method: SubtleMethod,
    args: &[HostValue],
) -> Result<SubtleCall, CryptoError> {
    let (required, message) = method.required();
    let missing = required
        .iter()
        .any(|idx| args.get(*idx).is_none_or(|arg| matches!(arg, HostValue::Undefined)));
    if missing {
        return Err(CryptoError::new(CryptoErrorKind::Data, message));
    }
    let arg = |idx: usize| args.get(idx).unwrap_or(&HostValue::Undefined);
    let key = |idx: usize| -> Result<Rc<CryptoKey>, CryptoError> {
        let id = arg(idx)
            .get("__keyId")
            .and_then(HostValue::as_str)
            .unwrap_or_default();
        registry.borrow_mut().get_key(id)
    };

    let call = match method {
        SubtleMethod::Digest => SubtleCall::Digest {
            algorithm: algorithm_arg(arg(0))?,
            data: bytes_arg(arg(1), "data")?,
        },
        SubtleMethod::Encrypt => SubtleCall::Encrypt {
            algorithm: algorithm_arg(arg(0))?,
            key: key(1)?,
            data: bytes_arg(arg(2), "data")?,
        },
        SubtleMethod::Decrypt => SubtleCall::Decrypt {
            algorithm: algorithm_arg(arg(0))?,
            key: key(1)?,
            data: bytes_arg(arg(2), "data")?,
        },
        SubtleMethod::Sign => SubtleCall::Sign {
            algorithm: algorithm_arg(arg(0))?,
            key: key(1)?,
            data: bytes_arg(arg(2), "data")?,
        },
        SubtleMethod::Verify => SubtleCall::Verify {
            algorithm: algorithm_arg(arg(0))?,
            key: key(1)?,
            signature: bytes_arg(arg(2), "signature")?,
            data: bytes_arg(arg(3), "data")?,
        },
        SubtleMethod::GenerateKey => SubtleCall::GenerateKey {
            algorithm: algorithm_arg(arg(0))?,
            extractable: truthy(arg(1)),
            usages: usages_arg(arg(2))?,
        },
        SubtleMethod::ImportKey => {
            let format = format_arg(arg(0))?;
            SubtleCall::ImportKey {
                format,
                key_data: key_data_arg(format, arg(1))?,
                algorithm: algorithm_arg(arg(2))?,
                extractable: truthy(arg(3)),
                usages: usages_arg(arg(4))?,
            }
        }
        SubtleMethod::ExportKey => SubtleCall::ExportKey {
            format: format_arg(arg(0))?,
            key: key(1)?,
        },
        SubtleMethod::DeriveBits => SubtleCall::DeriveBits {
            algorithm: algorithm_arg(arg(0))?,
            key: key(1)?,
            length: length_arg(arg(2))?,
        },
        SubtleMethod::DeriveKey => SubtleCall::DeriveKey {
            algorithm: algorithm_arg(arg(0))?,
            key: key(1)?,
            derived_key_type: algorithm_arg(arg(2))?,
            extractable: truthy(arg(3)),
            usages: usages_arg(arg(4))?,
        },
        SubtleMethod::WrapKey => SubtleCall::WrapKey {
            format: format_arg(arg(0))?,
            key: key(1)?,
            wrapping_key: key(2)?,
            algorithm: algorithm_arg(arg(3))?,
        },
        SubtleMethod::UnwrapKey => SubtleCall::UnwrapKey {
            format: format_arg(arg(0))?,
            wrapped_key: bytes_arg(arg(1), "wrappedKey")?,
            unwrapping_key: key(2)?,
            algorithm: algorithm_arg(arg(3))?,
            unwrapped_key_algorithm: algorithm_arg(arg(4))?,
            extractable: truthy(arg(5)),
            usages: usages_arg(arg(6))?,
        },
    };
    Ok(call)
}

// ============================================================================
// Bridge
// ============================================================================

/// Per-session crypto state shared by the installed VM functions and the
/// runner.
#[derive(Clone)]
pub struct CryptoBridge {
    provider: Option<Arc<dyn CryptoProvider>>,
    registry: Rc<RefCell<KeyRegistry>>,
    tracker: CryptoTracker,
}

impl CryptoBridge {
    pub fn new(
        provider: Option<Arc<dyn CryptoProvider>>,
        registry: Rc<RefCell<KeyRegistry>>,
    ) -> Self {
        let tracker = Rc::new(RefCell::new(KeepaliveTracker::new(Rc::clone(&registry))));
        Self {
            provider,
            registry,
            tracker,
        }
    }

    pub fn tracker(&self) -> &CryptoTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &Rc<RefCell<KeyRegistry>> {
        &self.registry
    }

    fn subtle(&self) -> Option<&dyn SubtleCrypto> {
        self.provider.as_deref().and_then(|provider| provider.subtle())
    }

    /// Install the `crypto` global.
    pub fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        ctx.eval::<(), _>(CRYPTO_BRIDGE_JS)?;

        let crypto = Object::new(ctx.clone())?;
        let provider = self.provider.clone();
        crypto.set(
            "getRandomValues",
            Func::from(
                move |ctx: Ctx<'js>, target: Opt<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                    get_random_values(&ctx, provider.as_deref(), target.0)
                },
            ),
        )?;
        let provider = self.provider.clone();
        crypto.set(
            "randomUUID",
            Func::from(move |ctx: Ctx<'js>| -> rquickjs::Result<String> {
                random_uuid(provider.as_deref())
                    .ok_or_else(|| {
                        Exception::throw_message(
                            &ctx,
                            "crypto.randomUUID is not available (requires WebCrypto)",
                        )
                    })
            }),
        )?;

        let subtle = Object::new(ctx.clone())?;
        for method in SubtleMethod::ALL {
            let bridge = self.clone();
            subtle.set(
                method.name(),
                Func::from(
                    move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Promise<'js>> {
                        bridge.call_subtle(&ctx, method, &args.0)
                    },
                ),
            )?;
        }
        crypto.set("subtle", subtle)?;
        ctx.globals().set("crypto", crypto)?;
        Ok(())
    }

    fn call_subtle<'js>(
        &self,
        ctx: &Ctx<'js>,
        method: SubtleMethod,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Promise<'js>> {
        let (promise, resolve, reject) = Promise::new(ctx)?;
        if self.subtle().is_none() {
            let message = format!(
                "crypto.subtle.{} is not available (requires WebCrypto)",
                method.name()
            );
            tracing::debug!(
                event = "sandbox.crypto.unavailable",
                method = method.name(),
                "Rejecting subtle call without provider"
            );
            let error = crypto_error_value(ctx, &message)?;
            reject.call::<_, ()>((error,))?;
            return Ok(promise);
        }

        let host_args: Vec<HostValue> = args.iter().map(to_host).collect();
        let call = resolve_call(&self.registry, method, &host_args)
            .unwrap_or_else(|error| SubtleCall::Failed { method, error });
        let op_id = self.tracker.borrow_mut().track(call);
        let register: Function<'js> = ctx.globals().get("__hopp_register_op")?;
        register.call::<_, ()>((op_id, resolve, reject))?;
        tracing::trace!(
            event = "sandbox.crypto.enqueue",
            op_id,
            method = method.name(),
            "Queued subtle operation"
        );
        Ok(promise)
    }

    /// Run a queued call on the host and settle its VM Promise.
    pub fn settle<'js>(&self, ctx: &Ctx<'js>, op_id: u64, call: SubtleCall) -> rquickjs::Result<()> {
        let method = call.method();
        let outcome = self
            .subtle()
            .ok_or_else(|| {
                CryptoError::unavailable(format!(
                    "crypto.subtle.{} is not available (requires WebCrypto)",
                    method.name()
                ))
            })
            .and_then(|subtle| execute(subtle, call))
            .map(|output| self.output_to_host(output));

        let settle_fn: Function<'js> = ctx.globals().get("__hopp_settle_op")?;
        match outcome {
            Ok(value) => {
                tracing::trace!(
                    event = "sandbox.crypto.resolve",
                    op_id,
                    method = method.name(),
                    "Resolved subtle operation"
                );
                settle_fn.call::<_, bool>((op_id, true, to_vm(ctx, &value)?))?;
            }
            Err(err) => {
                tracing::debug!(
                    event = "sandbox.crypto.reject",
                    op_id,
                    method = method.name(),
                    error = %err,
                    "Rejected subtle operation"
                );
                settle_fn.call::<_, bool>((op_id, false, err.message))?;
            }
        }
        Ok(())
    }

    fn output_to_host(&self, output: SubtleOutput) -> HostValue {
        match output {
            SubtleOutput::Bytes(bytes) => HostValue::Bytes(bytes),
            SubtleOutput::Bool(flag) => HostValue::Bool(flag),
            SubtleOutput::Key(key) => self.store_key(key),
            SubtleOutput::Pair(pair) => HostValue::map([
                ("privateKey", self.store_key(pair.private_key)),
                ("publicKey", self.store_key(pair.public_key)),
            ]),
            SubtleOutput::Exported(exported) => exported.into_host_value(),
        }
    }

    fn store_key(&self, key: CryptoKey) -> HostValue {
        let key = Rc::new(key);
        let id = self
            .registry
            .borrow_mut()
            .store(RegisteredKey::Single(Rc::clone(&key)));
        key.handle(&id)
    }
}

fn crypto_error_value<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Value<'js>> {
    let make: Function<'js> = ctx.globals().get("__hopp_crypto_error")?;
    make.call((message,))
}

/// Provider UUID, else a v4 UUID built from provider random bytes.
fn random_uuid(provider: Option<&dyn CryptoProvider>) -> Option<String> {
    let provider = provider?;
    provider.random_uuid().or_else(|| {
        let mut bytes = [0u8; 16];
        provider
            .get_random_values(&mut bytes)
            .ok()
            .map(|()| uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
    })
}

fn get_random_values<'js>(
    ctx: &Ctx<'js>,
    provider: Option<&dyn CryptoProvider>,
    target: Option<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let Some(provider) = provider else {
        return Err(Exception::throw_message(
            ctx,
            "crypto.getRandomValues is not available (requires WebCrypto)",
        ));
    };
    let Some(target) = target else {
        return Err(Exception::throw_message(
            ctx,
            "getRandomValues requires an array-like argument",
        ));
    };
    let Some(object) = target.as_object() else {
        return Err(Exception::throw_message(
            ctx,
            "getRandomValues requires an array-like argument",
        ));
    };

    let length = object
        .get::<_, Value>("length")?
        .as_number()
        .unwrap_or(0.0);
    let byte_length = object.get::<_, Value>("byteLength")?.as_number();
    let (count, width) =
        random_fill_shape(length, byte_length).map_err(|msg| Exception::throw_message(ctx, &msg))?;
    let mut bytes = vec![0u8; count * width];
    provider
        .get_random_values(&mut bytes)
        .map_err(|err| Exception::throw_message(ctx, &err.message))?;
    for (idx, chunk) in (0u32..).zip(bytes.chunks(width)) {
        let value = chunk
            .iter()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
        object.set(idx, value)?;
    }
    tracing::trace!(
        event = "sandbox.crypto.random_values",
        elements = count,
        width,
        "Filled random values"
    );
    Ok(target)
}

/// Element count and width for a `getRandomValues` target, checked
/// against [`MAX_RANDOM_VALUES_BYTES`] before anything is allocated.
fn random_fill_shape(length: f64, byte_length: Option<f64>) -> Result<(usize, usize), String> {
    if length < 0.0 || length.is_nan() || length.fract() != 0.0 {
        return Err("Failed to execute 'getRandomValues': Invalid array length".to_string());
    }
    let declared = byte_length.unwrap_or(length);
    #[allow(clippy::cast_precision_loss)]
    let max_bytes = MAX_RANDOM_VALUES_BYTES as f64;
    let exceeds = |bytes: f64| {
        format!(
            "Failed to execute 'getRandomValues': The ArrayBuffer/ArrayBufferView's byte length ({}) exceeds the maximum allowed ({MAX_RANDOM_VALUES_BYTES} bytes).",
            format_number(bytes)
        )
    };
    if declared > max_bytes {
        return Err(exceeds(declared));
    }
    if length > max_bytes {
        return Err(exceeds(length));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = length as usize;
    let width = element_width(declared, length);
    #[allow(clippy::cast_precision_loss)]
    let total = count
        .checked_mul(width)
        .filter(|total| *total <= MAX_RANDOM_VALUES_BYTES)
        .ok_or_else(|| exceeds(length * width as f64))? as f64;
    if (total - declared).abs() > f64::EPSILON {
        return Err(format!(
            "Failed to execute 'getRandomValues': byteLength ({}) does not match length ({})",
            format_number(declared),
            format_number(length)
        ));
    }
    Ok((count, width))
}

/// Bytes per element of a typed array: 1, 2 or 4; plain arrays get bytes.
fn element_width(byte_length: f64, length: f64) -> usize {
    if length > 0.0 {
        let ratio = byte_length / length;
        if (ratio - 2.0).abs() < f64::EPSILON {
            return 2;
        }
        if (ratio - 4.0).abs() < f64::EPSILON {
            return 4;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_registry::{KEY_EXPIRY_MS, ManualClock};
    use crate::webcrypto::{KeyAlgorithm, NativeCrypto};

    fn registry() -> RefCell<KeyRegistry> {
        RefCell::new(KeyRegistry::new(
            Arc::new(ManualClock::new(0)),
            KEY_EXPIRY_MS,
            Some(Arc::new(NativeCrypto::new())),
        ))
    }

    fn bytes(values: &[u8]) -> HostValue {
        HostValue::List(values.iter().map(|b| HostValue::Number(f64::from(*b))).collect())
    }

    #[test]
    fn normalize_converts_only_known_byte_fields() {
        let alg = HostValue::map([
            ("name", HostValue::string("AES-GCM")),
            ("iv", bytes(&[1, 2, 3])),
            ("tags", bytes(&[4])),
        ]);
        let normalized = normalize_algorithm(&alg);
        assert_eq!(normalized.get("iv"), Some(&HostValue::Bytes(vec![1, 2, 3])));
        assert_eq!(normalized.get("tags"), Some(&bytes(&[4])));
    }

    #[test]
    fn missing_arguments_use_fixed_messages() {
        let reg = registry();
        let err = resolve_call(&reg, SubtleMethod::Digest, &[HostValue::string("SHA-256")])
            .unwrap_err();
        assert_eq!(err.message, "digest requires data argument");

        let err = resolve_call(
            &reg,
            SubtleMethod::ExportKey,
            &[HostValue::string("raw"), HostValue::Undefined],
        )
        .unwrap_err();
        assert_eq!(err.message, "exportKey requires format and key arguments");

        let err = resolve_call(&reg, SubtleMethod::UnwrapKey, &[]).unwrap_err();
        assert!(err.message.starts_with("unwrapKey requires all arguments"));
    }

    #[test]
    fn unknown_key_ids_are_invalid_keys() {
        let reg = registry();
        let handle = HostValue::map([("__keyId", HostValue::string("not-a-key"))]);
        let err = resolve_call(
            &reg,
            SubtleMethod::Encrypt,
            &[HostValue::string("AES-GCM"), handle, bytes(&[1])],
        )
        .unwrap_err();
        assert_eq!(err.message, "Invalid key: key not found in registry");
    }

    #[test]
    fn stored_keys_resolve_by_handle() {
        let reg = registry();
        let id = reg.borrow_mut().store(CryptoKey::secret(
            KeyAlgorithm::AesGcm { length: 128 },
            false,
            vec![KeyUsage::Encrypt],
            vec![0; 16],
        ));
        let handle = HostValue::map([("__keyId", HostValue::string(id))]);
        let call = resolve_call(
            &reg,
            SubtleMethod::Encrypt,
            &[
                HostValue::map([
                    ("name", HostValue::string("AES-GCM")),
                    ("iv", bytes(&[0; 12])),
                ]),
                handle,
                HostValue::Bytes(b"hi".to_vec()),
            ],
        )
        .expect("resolve");
        let SubtleCall::Encrypt { algorithm, data, .. } = call else {
            panic!("expected encrypt call");
        };
        assert_eq!(algorithm.params.get("iv"), Some(&HostValue::Bytes(vec![0; 12])));
        assert_eq!(data, b"hi");
    }

    #[test]
    fn usages_and_formats_are_validated() {
        let reg = registry();
        let err = resolve_call(
            &reg,
            SubtleMethod::GenerateKey,
            &[
                HostValue::string("HMAC"),
                HostValue::Bool(true),
                HostValue::string("sign"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.message, "SyntaxError: keyUsages must be an array");

        let err = resolve_call(
            &reg,
            SubtleMethod::ImportKey,
            &[
                HostValue::string("pem"),
                bytes(&[1]),
                HostValue::string("HMAC"),
                HostValue::Bool(false),
                HostValue::List(vec![HostValue::string("sign")]),
            ],
        )
        .unwrap_err();
        assert!(err.message.starts_with("NotSupportedError"));
    }

    #[test]
    fn element_width_follows_typed_array_ratio() {
        assert_eq!(element_width(16.0, 16.0), 1);
        assert_eq!(element_width(32.0, 16.0), 2);
        assert_eq!(element_width(64.0, 16.0), 4);
        assert_eq!(element_width(0.0, 0.0), 1);
    }

    #[test]
    fn random_uuid_falls_back_to_provider_bytes() {
        struct BytesOnly;
        impl CryptoProvider for BytesOnly {
            fn get_random_values(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
                buf.fill(0xab);
                Ok(())
            }
        }
        let uuid = random_uuid(Some(&BytesOnly)).expect("uuid");
        assert_eq!(uuid, "abababab-abab-4bab-abab-abababababab");
        assert_eq!(random_uuid(None), None);
    }

    #[test]
    fn random_fill_shape_checks_length_before_allocating() {
        assert_eq!(random_fill_shape(16.0, Some(16.0)), Ok((16, 1)));
        assert_eq!(random_fill_shape(8.0, Some(32.0)), Ok((8, 4)));
        assert_eq!(random_fill_shape(3.0, None), Ok((3, 1)));
        assert_eq!(random_fill_shape(0.0, Some(0.0)), Ok((0, 1)));

        let forged = random_fill_shape(1e15, Some(16.0)).unwrap_err();
        assert!(forged.contains("exceeds the maximum allowed (65536 bytes)"), "{forged}");
        let wide = random_fill_shape(32_768.0, Some(131_072.0)).unwrap_err();
        assert!(wide.contains("exceeds the maximum allowed"), "{wide}");
        let mismatch = random_fill_shape(4.0, Some(12.0)).unwrap_err();
        assert!(mismatch.contains("does not match"), "{mismatch}");
        for length in [-1.0, 1.5, f64::NAN] {
            let err = random_fill_shape(length, None).unwrap_err();
            assert!(err.ends_with("Invalid array length"), "{err}");
        }
    }
}
