//! Benchmarks for `hopp_sandbox` script runs.
//!
//! Run with: cargo bench
//! Run specific: cargo bench -- digest

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use hopp_sandbox::environment::{EnvScope, EnvVariable, Environments, expand_template};
use hopp_sandbox::request::RequestSnapshot;
use hopp_sandbox::{NativeCrypto, SandboxConfig, ScriptInput, ScriptKind, ScriptRunner};

fn runner() -> ScriptRunner {
    let config = SandboxConfig {
        keepalive_poll_interval_ms: 0,
        ..SandboxConfig::default()
    };
    ScriptRunner::new(config, Some(Arc::new(NativeCrypto::new())))
}

fn environments(count: usize) -> Environments {
    let selected = (0..count)
        .map(|i| EnvVariable::new(format!("var{i}"), format!("value-<<base>>-{i}")))
        .collect();
    Environments::new(vec![EnvVariable::new("base", "root")], selected)
}

// ============================================================================
// Script Runs
// ============================================================================

fn bench_pre_request(c: &mut Criterion) {
    let runner = runner();
    let script = r"
        pw.env.set('token', 'abc');
        hopp.request.setHeader('Authorization', `Bearer ${pw.env.get('token')}`);
        pm.request.url.query.upsert({ key: 'page', value: '2' });
        console.log(pw.env.getResolve('var1'));
    ";
    c.bench_function("run/pre_request_env_and_query", |b| {
        b.iter(|| {
            let input = ScriptInput::new(ScriptKind::PreRequest, script)
                .with_request(RequestSnapshot::new("https://api.example.com/users?page=1", "GET"))
                .with_environment(environments(16));
            black_box(runner.run(input))
        });
    });
}

fn bench_digest(c: &mut Criterion) {
    let runner = runner();
    let mut group = c.benchmark_group("digest");
    for size in [64_usize, 4_096, 65_536] {
        let script = format!(
            "crypto.subtle.digest('SHA-256', new Uint8Array({size})).then((d) => console.log(d.byteLength));"
        );
        group.bench_with_input(BenchmarkId::new("sha256", size), &script, |b, script| {
            b.iter(|| black_box(runner.run(ScriptInput::new(ScriptKind::PreRequest, script.as_str()))));
        });
    }
    group.finish();
}

// ============================================================================
// Template Expansion
// ============================================================================

fn bench_expand_template(c: &mut Criterion) {
    let envs = environments(64);
    let vars = envs.variables(EnvScope::All);
    let template = (0..64).map(|i| format!("<<var{i}>>")).collect::<Vec<_>>().join("/");
    c.bench_function("expand_template/64_vars", |b| {
        b.iter(|| black_box(expand_template(black_box(&template), &vars)));
    });
}

criterion_group!(benches, bench_pre_request, bench_digest, bench_expand_template);
criterion_main!(benches);
