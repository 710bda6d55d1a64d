//! Script-facing `pw`, `hopp` and `pm` namespaces.
//!
//! The namespaces are plain JS objects built by [`BOOTSTRAP_JS`] on top of a
//! hidden native object. Every native call goes through one of three
//! dispatchers (`env`, `request`, `test`) that operate on the shared
//! [`SessionState`]. The dispatchers never call back into the VM, so a
//! `RefCell` borrow never spans script code.

use std::cell::RefCell;
use std::rc::Rc;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use rquickjs::function::Rest;
use rquickjs::prelude::Func;
use rquickjs::{Ctx, Exception, Value};

use crate::environment::{EnvScope, Environments};
use crate::marshal::{HostValue, to_host, to_vm};
use crate::request::{
    QueryParam, RequestMutation, RequestSnapshot, ResponseSnapshot, UrlParts, query_object,
};
use crate::runner::ScriptKind;
use crate::test_tree::{
    ExpectResult, ExpectStatus, LegacyInput, LegacyMatcher, TestStack, build_message,
    legacy_expect,
};

/// Mutable state one script run works against.
#[derive(Debug)]
pub struct SessionState {
    pub kind: ScriptKind,
    pub envs: Environments,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub tests: TestStack,
}

pub type SharedSession = Rc<RefCell<SessionState>>;

type Dispatch = fn(&mut SessionState, &str, &[HostValue]) -> Result<HostValue, String>;

fn key_arg(args: &[HostValue]) -> Result<&str, String> {
    args.first()
        .and_then(HostValue::as_str)
        .ok_or_else(|| "Expected key to be a string".to_string())
}

fn value_arg(args: &[HostValue], idx: usize) -> Result<&str, String> {
    args.get(idx)
        .and_then(HostValue::as_str)
        .ok_or_else(|| "Expected value to be a string".to_string())
}

fn scope_arg(args: &[HostValue], idx: usize) -> EnvScope {
    args.get(idx)
        .and_then(HostValue::as_str)
        .map_or(EnvScope::All, EnvScope::parse)
}

fn optional_string(value: Option<impl Into<String>>) -> HostValue {
    value.map_or(HostValue::Undefined, |value| HostValue::String(value.into()))
}

/// `pm.*.set` accepts any value: strings are stored verbatim, objects and
/// arrays as JSON, everything else in its JS string form.
fn stringify_loose(value: &HostValue) -> String {
    match value {
        HostValue::Map(_) | HostValue::List(_) => value.to_json().to_string(),
        other => other.to_js_string(),
    }
}

fn flag_arg(args: &[HostValue], idx: usize) -> bool {
    args.get(idx).and_then(HostValue::as_bool).unwrap_or(false)
}

fn text_arg(args: &[HostValue], idx: usize) -> String {
    args.get(idx).map(HostValue::to_js_string).unwrap_or_default()
}

impl SessionState {
    pub fn new(
        kind: ScriptKind,
        envs: Environments,
        request: RequestSnapshot,
        response: Option<ResponseSnapshot>,
    ) -> Self {
        Self {
            kind,
            envs,
            request,
            response,
            tests: TestStack::default(),
        }
    }

    /// Environment operations. A trailing scope name (`all`, `active`,
    /// `global`) picks the lists the call touches.
    pub fn env(&mut self, op: &str, args: &[HostValue]) -> Result<HostValue, String> {
        let envs = &mut self.envs;
        let value = match op {
            "get" => optional_string(envs.get(key_arg(args)?, scope_arg(args, 1))),
            "getResolve" => optional_string(envs.get_resolve(key_arg(args)?, scope_arg(args, 1))),
            "getInitialRaw" => {
                optional_string(envs.get_initial_raw(key_arg(args)?, scope_arg(args, 1)))
            }
            "resolve" => HostValue::String(envs.resolve(value_arg(args, 0)?)),
            "set" => {
                let key = key_arg(args)?;
                envs.set(key, value_arg(args, 1)?, scope_arg(args, 2));
                HostValue::Undefined
            }
            "setInitial" => {
                let key = key_arg(args)?;
                envs.set_initial(key, value_arg(args, 1)?, scope_arg(args, 2));
                HostValue::Undefined
            }
            "pmSet" => {
                let key = key_arg(args)?;
                let value = args.get(1).map(stringify_loose).unwrap_or_default();
                envs.set(key, &value, scope_arg(args, 2));
                HostValue::Undefined
            }
            "unset" => {
                envs.unset(key_arg(args)?, scope_arg(args, 1));
                HostValue::Undefined
            }
            "reset" => {
                envs.reset(key_arg(args)?, scope_arg(args, 1));
                HostValue::Undefined
            }
            "keys" => {
                let mut keys: Vec<HostValue> = Vec::new();
                for var in envs.variables(scope_arg(args, 0)) {
                    let key = HostValue::string(var.key.as_str());
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                HostValue::List(keys)
            }
            other => return Err(format!("Unknown environment operation: {other}")),
        };
        Ok(value)
    }

    /// Request reads plus mutations. Mutations are only allowed before the
    /// request is sent.
    pub fn request(&mut self, op: &str, args: &[HostValue]) -> Result<HostValue, String> {
        let value = match op {
            "get" => self.request.to_host_value(),
            "query" => HostValue::List(
                self.request
                    .query_params()
                    .iter()
                    .map(QueryParam::to_host_value)
                    .collect(),
            ),
            "queryObject" => query_object(&self.request.query_params()),
            "url" => UrlParts::parse(&self.request.endpoint)
                .map_or(HostValue::Undefined, |parts| parts.to_host_value()),
            "variable" => optional_string(self.request.request_variable(key_arg(args)?)),
            mutation => {
                if self.kind == ScriptKind::Test {
                    return Err("Request is read-only in test scripts".to_string());
                }
                self.request.apply(RequestMutation::from_call(mutation, args)?);
                HostValue::Undefined
            }
        };
        Ok(value)
    }

    /// Test blocks and expectation results.
    pub fn test(&mut self, op: &str, args: &[HostValue]) -> Result<HostValue, String> {
        match op {
            "push" => self.tests.push(text_arg(args, 0)),
            "pop" => self.tests.pop(),
            "legacy" => {
                let name = text_arg(args, 0);
                let matcher = LegacyMatcher::parse(&name)
                    .ok_or_else(|| format!("Unknown expectation: {name}"))?;
                let input = LegacyInput {
                    value: args.get(2).cloned().unwrap_or_default(),
                    value_type: text_arg(args, 3),
                    argument: args.get(4).cloned().unwrap_or_default(),
                    identical: flag_arg(args, 5),
                };
                self.tests
                    .record(legacy_expect(matcher, flag_arg(args, 1), &input));
            }
            "chai" => {
                let value = args.get(1).cloned().unwrap_or_default();
                let assertion_args = match args.get(4) {
                    Some(HostValue::List(items)) => items.as_slice(),
                    _ => &[],
                };
                let message =
                    build_message(&value, &text_arg(args, 2), &text_arg(args, 3), assertion_args);
                self.tests.record(ExpectResult::new(
                    ExpectStatus::from_outcome(flag_arg(args, 0)),
                    message,
                ));
            }
            "record" => {
                let status = match text_arg(args, 0).as_str() {
                    "pass" => ExpectStatus::Pass,
                    "fail" => ExpectStatus::Fail,
                    _ => ExpectStatus::Error,
                };
                self.tests.record(ExpectResult::new(status, text_arg(args, 1)));
            }
            other => return Err(format!("Unknown test operation: {other}")),
        }
        Ok(HostValue::Undefined)
    }
}

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// `btoa`: every code unit must fit in a byte.
pub fn btoa(input: &str) -> Result<String, String> {
    let bytes = input
        .chars()
        .map(|ch| u8::try_from(u32::from(ch)))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| "Invalid character: btoa input must be Latin-1".to_string())?;
    Ok(LENIENT_BASE64.encode(bytes))
}

/// `atob`: ASCII whitespace is ignored, padding is optional and the output
/// maps each byte to one code unit.
pub fn atob(input: &str) -> Result<String, String> {
    let compact: String = input
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let bytes = LENIENT_BASE64
        .decode(compact)
        .map_err(|_| "Invalid character: atob input is not valid base64".to_string())?;
    Ok(bytes.into_iter().map(char::from).collect())
}

/// Install `atob`, `btoa` and the `pw`, `hopp` and `pm` namespaces.
pub fn install<'js>(ctx: &Ctx<'js>, session: &SharedSession) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set(
        "btoa",
        Func::from(|ctx: Ctx<'js>, input: String| -> rquickjs::Result<String> {
            btoa(&input).map_err(|message| Exception::throw_message(&ctx, &message))
        }),
    )?;
    globals.set(
        "atob",
        Func::from(|ctx: Ctx<'js>, input: String| -> rquickjs::Result<String> {
            atob(&input).map_err(|message| Exception::throw_message(&ctx, &message))
        }),
    )?;

    let native = rquickjs::Object::new(ctx.clone())?;
    let dispatchers: [(&'static str, Dispatch); 3] = [
        ("env", SessionState::env),
        ("request", SessionState::request),
        ("test", SessionState::test),
    ];
    for (name, dispatch) in dispatchers {
        let session = Rc::clone(session);
        native.set(
            name,
            Func::from(
                move |ctx: Ctx<'js>,
                      op: String,
                      args: Rest<Value<'js>>|
                      -> rquickjs::Result<Value<'js>> {
                    let args: Vec<HostValue> = args.0.iter().map(to_host).collect();
                    let outcome = dispatch(&mut session.borrow_mut(), &op, &args);
                    match outcome {
                        Ok(value) => to_vm(&ctx, &value),
                        Err(message) => {
                            tracing::trace!(
                                event = "sandbox.dsl.reject",
                                dispatcher = name,
                                op = op.as_str(),
                                message = message.as_str(),
                                "Rejected script call"
                            );
                            Err(Exception::throw_message(&ctx, &message))
                        }
                    }
                },
            ),
        )?;
    }

    let (kind, response) = {
        let state = session.borrow();
        let response = state
            .response
            .as_ref()
            .map_or(HostValue::Undefined, ResponseSnapshot::to_host_value);
        (state.kind, response)
    };
    native.set("kind", kind.as_str())?;
    native.set("response", to_vm(ctx, &response)?)?;

    globals.set("__hopp_native", native)?;
    ctx.eval::<(), _>(BOOTSTRAP_JS)
}

/// Builds the namespaces from `__hopp_native`, then removes it from globals.
pub const BOOTSTRAP_JS: &str = r#"
(function () {
    'use strict';
    const N = globalThis.__hopp_native;
    delete globalThis.__hopp_native;

    const isTest = N.kind === 'test';
    const freeze = Object.freeze;
    const lower = (value) => String(value).toLowerCase();
    const orNull = (value) => (value === undefined ? null : value);

    // Environment

    const envScope = (source) => ({
        get: (key) => orNull(N.env('getResolve', key, source)),
        getRaw: (key) => orNull(N.env('get', key, source)),
        set: (key, value) => N.env('set', key, value, source),
        delete: (key) => N.env('unset', key, source),
        reset: (key) => N.env('reset', key, source),
        getInitialRaw: (key) => orNull(N.env('getInitialRaw', key, source)),
        setInitial: (key, value) => N.env('setInitial', key, value, source),
    });

    const hoppEnv = Object.assign(envScope('all'), {
        active: freeze(envScope('active')),
        global: freeze(envScope('global')),
    });

    const pwEnv = {
        get: (key) => N.env('get', key, 'all'),
        getResolve: (key) => N.env('getResolve', key, 'all'),
        set: (key, value) => N.env('set', key, value, 'all'),
        unset: (key) => N.env('unset', key, 'all'),
        resolve: (value) => N.env('resolve', value),
    };

    const snapshotOf = (source) => {
        const out = {};
        for (const key of N.env('keys', source)) {
            out[key] = N.env('getResolve', key, source);
        }
        return out;
    };

    const pmScope = (source) => ({
        get: (key) => N.env('getResolve', key, source),
        set: (key, value) => N.env('pmSet', key, value, source),
        unset: (key) => N.env('unset', key, source),
        has: (key) => N.env('get', key, source) !== undefined,
        clear: () => N.env('keys', source).forEach((key) => N.env('unset', key, source)),
        toObject: () => snapshotOf(source),
    });

    const pmVariables = {
        get: (key) => N.env('getResolve', key, 'all'),
        set: (key, value) => N.env('pmSet', key, value, 'active'),
        has: (key) => N.env('get', key, 'all') !== undefined,
        toObject: () => snapshotOf('all'),
        replaceIn: (template) => {
            if (typeof template !== 'string') {
                return template;
            }
            return template.replace(/\{\{([^}]+)\}\}/g, (match, key) => {
                const value = N.env('getResolve', key.trim(), 'all');
                return value === undefined ? match : value;
            });
        },
    };

    // Request

    const request = () => N.request('get');
    const mutate = (op, ...args) => {
        N.request(op, ...args);
    };

    const listHelpers = (list) => ({
        count: () => list().length,
        each: (fn) => list().forEach((item) => fn(item)),
        map: (fn) => list().map((item) => fn(item)),
        filter: (fn) => list().filter((item) => fn(item)),
        idx: (index) => orNull(list()[index]),
        indexOf: (item) => {
            const key = item && typeof item === 'object' ? item.key : item;
            return list().findIndex((entry) => entry.key === key);
        },
    });

    const queryList = () => {
        const list = () => N.request('query');
        const matching = (key) => list().filter((param) => param.key === key);
        const api = Object.assign(listHelpers(list), {
            get: (key) => {
                const found = matching(key);
                return found.length ? found[0].value : null;
            },
            has: (key) => matching(key).length > 0,
            all: () => N.request('queryObject'),
            toObject: () => N.request('queryObject'),
            find: (rule) => {
                const predicate = typeof rule === 'function' ? rule : (param) => param.key === rule;
                return orNull(list().find(predicate));
            },
        });
        if (!isTest) {
            Object.assign(api, {
                add: (param) => mutate('queryAdd', param),
                upsert: (param) => mutate('queryUpsert', param),
                set: (key, value) => mutate(
                    'queryUpsert',
                    key !== null && typeof key === 'object' ? key : { key, value },
                ),
                remove: (key) => mutate('queryRemove', key),
                clear: () => mutate('queryClear'),
                insert: (param, before) => mutate('queryInsert', param, before),
                append: (param) => mutate('queryAppend', param),
                assimilate: (source, prune) => mutate('queryAssimilate', source, prune),
            });
        }
        return freeze(api);
    };

    const headerList = () => {
        const list = () => request().headers;
        const named = (name) => (header) => lower(header.key) === lower(name);
        const all = () => {
            const out = {};
            list().forEach((header) => {
                out[header.key] = header.value;
            });
            return out;
        };
        const api = Object.assign(listHelpers(list), {
            get: (name) => {
                const header = list().find(named(name));
                return header ? header.value : null;
            },
            has: (name) => list().some(named(name)),
            all,
            toObject: all,
            find: (rule) => {
                const predicate = typeof rule === 'function' ? rule : named(rule);
                return orNull(list().find(predicate));
            },
        });
        if (!isTest) {
            Object.assign(api, {
                add: (header) => mutate('addHeader', header),
                upsert: (header) => mutate('upsertHeader', header),
                remove: (name) => mutate('removeHeader', name),
                clear: () => mutate('setHeaders', []),
            });
        }
        return freeze(api);
    };

    const hoppRequest = {};
    for (const prop of ['url', 'method', 'params', 'headers', 'body', 'auth']) {
        Object.defineProperty(hoppRequest, prop, {
            enumerable: true,
            get: () => request()[prop],
            set: () => {
                throw new TypeError(`hopp.request.${prop} is read-only`);
            },
        });
    }
    Object.defineProperty(hoppRequest, 'query', { enumerable: true, get: queryList });
    hoppRequest.variables = freeze({
        get: (key) => orNull(N.request('variable', key)),
    });
    if (!isTest) {
        for (const op of [
            'setUrl', 'setMethod', 'setHeader', 'setHeaders', 'removeHeader',
            'setParam', 'setParams', 'removeParam', 'setBody', 'setAuth',
        ]) {
            hoppRequest[op] = (...args) => mutate(op, ...args);
        }
    }
    freeze(hoppRequest);

    const encodeQuery = () => N.request('query')
        .map((param) => `${encodeURIComponent(param.key)}=${encodeURIComponent(param.value)}`)
        .join('&');

    const urlObject = () => {
        const part = (name, fallback) => {
            const parts = N.request('url');
            return parts ? parts[name] : fallback;
        };
        const url = {
            toString: () => request().url,
            getHost: () => part('host', []).join('.'),
            getPath: () => {
                const path = part('path', []);
                return path.length ? `/${path.join('/')}` : '/';
            },
            getQueryString: encodeQuery,
            getPathWithQuery: () => {
                const query = encodeQuery();
                return url.getPath() + (query ? `?${query}` : '');
            },
            getRemote: (forcePort) => {
                const host = url.getHost();
                const port = part('port', '');
                const standard = port === '' || port === '80' || port === '443';
                return forcePort || !standard ? `${host}:${port}` : host;
            },
        };
        for (const name of ['protocol', 'port', 'hash']) {
            Object.defineProperty(url, name, { enumerable: true, get: () => part(name, '') });
        }
        for (const name of ['host', 'path']) {
            Object.defineProperty(url, name, { enumerable: true, get: () => part(name, []) });
        }
        Object.defineProperty(url, 'query', { enumerable: true, get: queryList });
        if (!isTest) {
            url.update = (value) => {
                if (typeof value === 'string') {
                    return mutate('setUrl', value);
                }
                if (value && typeof value.toString === 'function') {
                    return mutate('setUrl', String(value.toString()));
                }
                throw new Error('URL update requires a string or object with toString() method');
            };
            url.addQueryParams = (params) => {
                if (!Array.isArray(params)) {
                    throw new Error('addQueryParams requires an array of parameters');
                }
                params.forEach((param) => mutate('queryAdd', param));
            };
            url.removeQueryParams = (params) => {
                const keys = Array.isArray(params) ? params : [params];
                keys.forEach((key) => mutate('queryRemove', key));
            };
        }
        return freeze(url);
    };

    const bodyUpdate = (spec) => {
        if (typeof spec === 'string') {
            return mutate('setBody', { contentType: 'text/plain', body: spec });
        }
        if (!spec || typeof spec !== 'object') {
            throw new Error('Body update requires a string or object');
        }
        const mode = spec.mode || 'raw';
        if (mode === 'raw') {
            const raw = spec.options && spec.options.raw;
            const json = raw && raw.language === 'json';
            return mutate('setBody', {
                contentType: json ? 'application/json' : 'text/plain',
                body: spec.raw === undefined ? '' : String(spec.raw),
            });
        }
        if (mode === 'urlencoded') {
            return mutate('setBody', {
                contentType: 'application/x-www-form-urlencoded',
                body: spec.urlencoded || [],
            });
        }
        if (mode === 'formdata') {
            return mutate('setBody', { contentType: 'multipart/form-data', body: spec.formdata || [] });
        }
        throw new Error(`Unsupported body mode: ${mode}`);
    };

    const readOnly = (name) => () => {
        throw new TypeError(`pm.request.${name} is read-only`);
    };

    const pmRequest = {};
    Object.defineProperty(pmRequest, 'url', {
        enumerable: true,
        get: urlObject,
        set: isTest ? readOnly('url') : (value) => mutate('setUrl', String(value)),
    });
    Object.defineProperty(pmRequest, 'method', {
        enumerable: true,
        get: () => request().method,
        set: isTest ? readOnly('method') : (value) => mutate('setMethod', value),
    });
    Object.defineProperty(pmRequest, 'headers', { enumerable: true, get: headerList });
    Object.defineProperty(pmRequest, 'body', {
        enumerable: true,
        get: () => {
            const body = Object.assign({}, request().body);
            if (!isTest) {
                body.update = bodyUpdate;
            }
            return freeze(body);
        },
    });
    Object.defineProperty(pmRequest, 'auth', { enumerable: true, get: () => request().auth });
    freeze(pmRequest);

    // Response

    const raw = N.response;
    let hoppResponse;
    let pwResponse;
    let pmResponse;
    if (isTest && raw !== undefined) {
        const toJSON = () => {
            const body = raw.body;
            if (body === null || body === undefined) {
                return null;
            }
            if (typeof body !== 'string') {
                return body;
            }
            try {
                return JSON.parse(body);
            } catch (_) {
                throw new Error('Invalid JSON string');
            }
        };
        const toText = () => raw.text;
        const toBytes = () => Uint8Array.from(Array.prototype.slice.call(raw.bytes));
        const header = (name) => {
            const found = raw.headers.find((entry) => lower(entry.key) === lower(name));
            return found ? found.value : undefined;
        };
        hoppResponse = freeze({
            statusCode: raw.status,
            statusText: raw.statusText,
            headers: freeze(raw.headers.map((entry) => freeze(entry))),
            responseTime: raw.responseTime,
            body: freeze({ asJSON: toJSON, asText: toText, bytes: toBytes }),
            text: toText,
            json: toJSON,
        });
        pwResponse = freeze({ status: raw.status, body: raw.body, headers: raw.headers });
        pmResponse = freeze({
            code: raw.status,
            status: raw.statusText,
            responseTime: raw.responseTime,
            text: toText,
            json: toJSON,
            headers: freeze({
                get: header,
                has: (name) => header(name) !== undefined,
                all: () => raw.headers.slice(),
            }),
        });
    }

    // Tests

    const runTest = (descriptor, fn) => {
        N.test('push', String(descriptor));
        try {
            if (typeof fn === 'function') {
                fn();
            }
        } finally {
            N.test('pop');
        }
    };

    const LEGACY = [
        'toBe', 'toBeLevel2xx', 'toBeLevel3xx', 'toBeLevel4xx', 'toBeLevel5xx',
        'toBeType', 'toHaveLength', 'toInclude',
    ];

    const legacy = (value, negated) => {
        const matchers = {};
        for (const name of LEGACY) {
            matchers[name] = (arg) => {
                const type = typeof value;
                N.test('legacy', name, negated, value, type, arg, value === arg);
            };
        }
        return matchers;
    };

    const legacyExpect = (value) => {
        const matchers = legacy(value, false);
        Object.defineProperty(matchers, 'not', { get: () => freeze(legacy(value, true)) });
        return freeze(matchers);
    };

    const display = (value) => {
        if (typeof value === 'function') {
            const source = Function.prototype.toString.call(value);
            return /\[native code\]/.test(source) ? value.name : source;
        }
        if (typeof value === 'symbol') {
            return String(value);
        }
        if (typeof value === 'bigint') {
            return `${value}n`;
        }
        if (value instanceof RegExp) {
            return String(value);
        }
        if (value instanceof Date) {
            return `new Date(${isNaN(value.getTime()) ? 'Invalid Date' : value.toISOString()})`;
        }
        if (value instanceof Map) {
            const entries = Array.from(value.entries()).map(([k, v]) => `[${k}, ${v}]`);
            return entries.length ? `new Map([${entries.join(', ')}])` : 'new Map()';
        }
        if (value instanceof Set) {
            const items = Array.from(value).join(', ');
            return value.size ? `new Set([${items}])` : 'new Set()';
        }
        if (value instanceof Error) {
            return `${value.name}: ${value.message}`;
        }
        return value;
    };

    const typeOf = (value) => {
        if (value === null) {
            return 'null';
        }
        if (Array.isArray(value)) {
            return 'array';
        }
        return Object.prototype.toString.call(value).slice(8, -1).toLowerCase();
    };

    const deepEqual = (a, b) => {
        if (a === b) {
            return true;
        }
        if (typeof a === 'number' && typeof b === 'number') {
            return Number.isNaN(a) && Number.isNaN(b);
        }
        if (a === null || b === null || typeof a !== 'object' || typeof b !== 'object') {
            return false;
        }
        if (Object.getPrototypeOf(a) !== Object.getPrototypeOf(b)) {
            return false;
        }
        if (a instanceof Date) {
            return a.getTime() === b.getTime();
        }
        if (a instanceof RegExp) {
            return String(a) === String(b);
        }
        if (a instanceof Map) {
            return a.size === b.size
                && Array.from(a).every(([key, value]) => b.has(key) && deepEqual(value, b.get(key)));
        }
        if (a instanceof Set) {
            const rest = Array.from(b);
            return a.size === b.size
                && Array.from(a).every((item) => rest.some((other) => deepEqual(item, other)));
        }
        const keysA = Object.keys(a);
        const keysB = Object.keys(b);
        return keysA.length === keysB.length
            && keysA.every((key) => Object.prototype.hasOwnProperty.call(b, key) && deepEqual(a[key], b[key]));
    };

    const sizeOf = (value) => {
        if (value instanceof Map || value instanceof Set) {
            return value.size;
        }
        return value === null || value === undefined ? undefined : value.length;
    };

    const isEmpty = (value) => {
        if (typeof value === 'string' || Array.isArray(value)) {
            return value.length === 0;
        }
        if (value instanceof Map || value instanceof Set) {
            return value.size === 0;
        }
        if (value !== null && typeof value === 'object') {
            return Object.keys(value).length === 0;
        }
        return false;
    };

    const messageOf = (error) => (
        error && error.message !== undefined ? String(error.message) : String(error)
    );

    const CHAINS = [
        'to', 'be', 'been', 'is', 'that', 'which', 'and', 'has', 'have', 'with',
        'at', 'of', 'same', 'but', 'does', 'still', 'also',
    ];
    const FLAGS = {
        not: (flags) => ({ negate: !flags.negate }),
        deep: () => ({ deep: true }),
        own: () => ({ own: true }),
        nested: () => ({ nested: true }),
        any: () => ({ any: true }),
        all: () => ({ all: true }),
        itself: () => ({ itself: true }),
    };

    const assertion = (value, mods, flags) => {
        const self = {};
        const next = (word, extra) => assertion(value, `${mods} ${word}`, Object.assign({}, flags, extra));
        const record = (passed, name, args) => {
            const outcome = flags.negate ? !passed : !!passed;
            N.test('chai', outcome, display(value), mods, name, (args || []).map(display));
            return self;
        };
        const getter = (name, get) => Object.defineProperty(self, name, { get });
        const method = (names, fn) => names.forEach((name) => {
            self[name] = fn;
        });
        const chainable = (names, extra, fn) => names.forEach((name) => {
            getter(name, () => {
                const call = (...args) => fn(...args);
                Object.setPrototypeOf(call, next(name, extra));
                return call;
            });
        });

        CHAINS.forEach((word) => getter(word, () => next(word, {})));
        Object.keys(FLAGS).forEach((word) => getter(word, () => next(word, FLAGS[word](flags))));

        const check = (test, name) => () => record(test(), name);
        getter('ok', check(() => !!value, 'ok'));
        getter('true', check(() => value === true, 'true'));
        getter('false', check(() => value === false, 'false'));
        getter('null', check(() => value === null, 'null'));
        getter('undefined', check(() => value === undefined, 'undefined'));
        getter('NaN', check(() => typeof value === 'number' && Number.isNaN(value), 'NaN'));
        getter('exist', check(() => value !== null && value !== undefined, 'exist'));
        getter('empty', check(() => isEmpty(value), 'empty'));
        getter('arguments', check(() => typeOf(value) === 'arguments', 'arguments'));
        getter('extensible', check(() => value !== null
            && (typeof value === 'object' || typeof value === 'function')
            && Object.isExtensible(value), 'extensible'));
        getter('sealed', check(() => Object.isSealed(value), 'sealed'));
        getter('frozen', check(() => Object.isFrozen(value), 'frozen'));

        method(['equal', 'equals', 'eq'], (expected) => record(
            flags.deep ? deepEqual(value, expected) : value === expected,
            flags.deep ? 'deep equal' : 'equal',
            [expected],
        ));
        method(['eql', 'eqls'], (expected) => record(deepEqual(value, expected), 'eql', [expected]));
        method(['a', 'an'], (type) => {
            const article = /^[aeiou]/i.test(String(type)) ? 'an' : 'a';
            return record(typeOf(value) === lower(type), `${article} ${type}`);
        });
        method(['instanceof', 'instanceOf'], (ctor) => record(
            typeof ctor === 'function' && value instanceof ctor,
            'be an instanceof',
            [ctor],
        ));
        method(['throw', 'throws', 'Throw'], (errLike, errMsg) => {
            let thrown = false;
            let caught;
            if (typeof value === 'function') {
                try {
                    value();
                } catch (error) {
                    thrown = true;
                    caught = error;
                }
            }
            let passed = thrown;
            if (thrown && errLike !== undefined) {
                if (errLike instanceof RegExp) {
                    passed = errLike.test(messageOf(caught));
                } else if (typeof errLike === 'string') {
                    passed = messageOf(caught).includes(errLike);
                } else if (typeof errLike === 'function') {
                    passed = caught instanceof errLike;
                } else if (errLike instanceof Error) {
                    passed = caught === errLike;
                }
            }
            if (passed && errMsg !== undefined) {
                passed = errMsg instanceof RegExp
                    ? errMsg.test(messageOf(caught))
                    : messageOf(caught).includes(String(errMsg));
            }
            return record(passed, 'throw', [errLike, errMsg].filter((arg) => arg !== undefined));
        });
        method(['respondTo', 'respondsTo'], (name) => {
            const target = typeof value === 'function' && !flags.itself ? value.prototype : value;
            return record(
                target !== null && target !== undefined && typeof target[name] === 'function',
                `respondTo '${name}'`,
            );
        });
        method(['satisfy', 'satisfies'], (fn) => record(!!fn(value), 'satisfy'));
        method(['match', 'matches'], (pattern) => record(
            pattern instanceof RegExp && pattern.test(String(value)),
            'match',
            [pattern],
        ));
        method(['string'], (part) => record(
            typeof value === 'string' && value.includes(part),
            'have string',
            [part],
        ));
        method(['closeTo', 'approximately'], (expected, delta) => record(
            typeof value === 'number' && Math.abs(value - expected) <= delta,
            'closeTo',
            [expected],
        ));

        const includes = (needle) => {
            const same = (item) => (flags.deep ? deepEqual(item, needle) : item === needle);
            let passed = false;
            if (typeof value === 'string') {
                passed = value.includes(String(needle));
            } else if (Array.isArray(value)) {
                passed = value.some(same);
            } else if (value instanceof Set) {
                passed = Array.from(value).some(same);
            } else if (value instanceof Map) {
                passed = Array.from(value.values()).some(same);
            } else if (value !== null && typeof value === 'object'
                && needle !== null && typeof needle === 'object') {
                passed = Object.keys(needle).every((key) => (flags.deep
                    ? deepEqual(value[key], needle[key])
                    : value[key] === needle[key]));
            }
            return record(passed, 'include', [needle]);
        };
        chainable(['include', 'includes', 'contain', 'contains'], { include: true }, includes);

        const lengthOf = (expected) => record(sizeOf(value) === expected, 'have lengthOf', [expected]);
        chainable(['lengthOf', 'length'], { length: true }, lengthOf);

        const subject = () => (flags.length ? sizeOf(value) : value);
        const compare = (names, label, test) => method(names, (bound) => record(test(subject(), bound), label, [bound]));
        compare(['above', 'gt', 'greaterThan'], 'above', (actual, bound) => actual > bound);
        compare(['below', 'lt', 'lessThan'], 'below', (actual, bound) => actual < bound);
        compare(['least', 'gte', 'greaterThanOrEqual'], 'at least', (actual, bound) => actual >= bound);
        compare(['most', 'lte', 'lessThanOrEqual'], 'at most', (actual, bound) => actual <= bound);
        method(['within'], (start, finish) => {
            const actual = subject();
            return record(actual >= start && actual <= finish, 'within', [start, finish]);
        });

        const propertyOf = (name, ...rest) => {
            const path = flags.nested
                ? String(name).split(/\.|\[|\]/).filter((segment) => segment !== '')
                : [name];
            let target = value;
            let found = true;
            for (const segment of path) {
                if (target === null || target === undefined) {
                    found = false;
                    break;
                }
                const present = flags.own
                    ? Object.prototype.hasOwnProperty.call(Object(target), segment)
                    : segment in Object(target);
                if (!present) {
                    found = false;
                    break;
                }
                target = target[segment];
            }
            let passed = found;
            if (found && rest.length > 0) {
                passed = flags.deep ? deepEqual(target, rest[0]) : target === rest[0];
            }
            const label = flags.own ? `own property '${name}'` : `property '${name}'`;
            record(passed, label, rest.slice(0, 1));
            return found && !flags.negate ? assertion(target, '', {}) : self;
        };
        method(['property'], propertyOf);
        method(['ownProperty', 'haveOwnProperty'], (name, ...rest) => assertion(
            value,
            mods,
            Object.assign({}, flags, { own: true }),
        ).property(name, ...rest));

        method(['oneOf'], (list) => {
            const candidates = Array.isArray(list) ? list : [];
            const passed = flags.include
                ? candidates.some((item) => (typeof value === 'string' || Array.isArray(value))
                    && value.includes(item))
                : candidates.some((item) => (flags.deep ? deepEqual(value, item) : value === item));
            return record(passed, flags.include ? 'include oneOf' : 'oneOf', [candidates]);
        });

        method(['keys', 'key'], (...args) => {
            let expected = args;
            if (args.length === 1 && Array.isArray(args[0])) {
                expected = args[0];
            } else if (args.length === 1 && args[0] !== null && typeof args[0] === 'object') {
                expected = Object.keys(args[0]);
            }
            expected = expected.map(String);
            let actual = [];
            if (value instanceof Map || value instanceof Set) {
                actual = Array.from(value.keys()).map(String);
            } else if (value !== null && value !== undefined) {
                actual = Object.keys(value);
            }
            const present = expected.filter((key) => actual.includes(key));
            let passed;
            if (flags.any) {
                passed = present.length > 0;
            } else if (flags.include) {
                passed = present.length === expected.length;
            } else {
                passed = present.length === expected.length && actual.length === expected.length;
            }
            return record(passed, 'keys', [expected]);
        });

        method(['members'], (list) => {
            const expected = Array.isArray(list) ? list : [];
            const actual = Array.isArray(value) ? value : [];
            const has = (item) => actual.some((other) => (flags.deep ? deepEqual(other, item) : other === item));
            const covered = expected.every(has);
            const passed = flags.include ? covered : covered && actual.length === expected.length;
            return record(passed, flags.include ? 'include members' : 'members', [expected]);
        });

        Object.assign(self, legacy(value, !!flags.negate));
        return self;
    };

    const expect = (value) => assertion(value, '', {});
    expect.fail = (...args) => {
        const message = args.length === 1 ? args[0] : args[2];
        throw new Error(message === undefined ? 'expect.fail()' : String(message));
    };

    // Namespaces

    const pw = { env: pwEnv };
    const hopp = { env: hoppEnv, request: hoppRequest };
    const pm = {
        environment: pmScope('active'),
        globals: pmScope('global'),
        variables: pmVariables,
        request: pmRequest,
        info: freeze({ eventName: isTest ? 'test' : 'prerequest' }),
    };
    if (isTest) {
        Object.assign(pw, { expect: legacyExpect, test: runTest, response: pwResponse });
        Object.assign(hopp, { expect, test: runTest, response: hoppResponse });
        Object.assign(pm, { expect, test: runTest, response: pmResponse });
    }
    globalThis.pw = pw;
    globalThis.hopp = hopp;
    globalThis.pm = pm;
})();
"#;
