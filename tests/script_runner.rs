//! Script runs through the `pw`, `hopp` and `pm` namespaces.

mod common;

use common::{
    console_lines, expectations, json_response, messages_with, run, run_pre, run_test,
    sample_request, try_run,
};
use hopp_sandbox::console::ConsoleLevel;
use hopp_sandbox::environment::{EnvScope, EnvVariable, Environments};
use hopp_sandbox::request::KeyValue;
use hopp_sandbox::test_tree::ExpectStatus;
use hopp_sandbox::{ScriptInput, ScriptKind};
use serde_json::json;

fn environments() -> Environments {
    Environments::new(
        vec![EnvVariable::new("host", "example.com")],
        vec![EnvVariable::new("url", "https://<<host>>/api")],
    )
}

fn pre(script: &str) -> ScriptInput {
    ScriptInput::new(ScriptKind::PreRequest, script)
        .with_request(sample_request())
        .with_environment(environments())
}

fn test_with_response(script: &str) -> ScriptInput {
    let mut response = json_response(200, json!({ "name": "Ada", "tags": ["x", "y"] }));
    response
        .headers
        .push(KeyValue::new("Content-Type", "application/json"));
    ScriptInput::new(ScriptKind::Test, script)
        .with_request(sample_request())
        .with_environment(environments())
        .with_response(response)
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn synchronous_throw_keeps_console_output() {
    let failure = try_run(pre("console.log('step 1'); throw new Error('boom');")).unwrap_err();
    assert_eq!(failure.to_string(), "Script execution failed: boom");
    assert_eq!(console_lines(&failure.console_entries), vec!["step 1"]);
}

#[test]
fn failing_test_body_fails_the_script() {
    let failure =
        try_run(test_with_response("hopp.test('x', () => hopp.expect.fail('nope'));")).unwrap_err();
    assert_eq!(failure.message, "nope");
}

// ============================================================================
// Environment
// ============================================================================

#[test]
fn env_reads_and_writes_flow_into_the_outcome() {
    let outcome = run(pre(
        r"
        pw.env.set('token', 'abc');
        hopp.env.global.set('region', 'eu');
        pm.environment.set('count', 3);
        console.log(
            pw.env.get('token'),
            pw.env.getResolve('url'),
            pw.env.resolve('<<host>>!'),
            hopp.env.get('missing'),
            pw.env.get('missing'),
        );
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["abc https://example.com/api example.com! null undefined"]
    );
    let envs = &outcome.updated_envs;
    assert_eq!(envs.get("token", EnvScope::Active), Some("abc"));
    assert_eq!(envs.get("count", EnvScope::Active), Some("3"));
    assert_eq!(envs.get("region", EnvScope::Global), Some("eu"));
    assert_eq!(envs.get("region", EnvScope::Active), None);
}

#[test]
fn env_reset_restores_the_initial_value() {
    let outcome = run(pre(
        r"
        hopp.env.set('url', 'changed');
        console.log(hopp.env.getRaw('url'), hopp.env.getInitialRaw('url'));
        hopp.env.reset('url');
        console.log(hopp.env.getRaw('url'));
        hopp.env.active.setInitial('url', 'seed');
        hopp.env.active.reset('url');
        hopp.env.delete('host');
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["changed https://<<host>>/api", "https://<<host>>/api"]
    );
    assert_eq!(outcome.updated_envs.get("url", EnvScope::All), Some("seed"));
    assert_eq!(outcome.updated_envs.get("host", EnvScope::All), None);
}

#[test]
fn pm_scopes_expose_has_and_to_object() {
    let outcome = run(pre(
        r"
        pm.globals.set('g', 'v');
        console.log(pm.environment.has('url'), pm.environment.has('host'), pm.globals.has('host'));
        console.log(JSON.stringify(pm.globals.toObject()));
        console.log(pm.variables.replaceIn('{{url}}/users/{{unknown}}'));
        pm.environment.clear();
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec![
            "true false true",
            r#"{"host":"example.com","g":"v"}"#,
            "https://example.com/api/users/{{unknown}}",
        ]
    );
    assert!(outcome.updated_envs.selected.is_empty());
    assert_eq!(outcome.updated_envs.global.len(), 2);
}

#[test]
fn non_string_env_key_is_rejected() {
    let failure = try_run(pre("pw.env.set(1, 'x');")).unwrap_err();
    assert_eq!(failure.message, "Expected key to be a string");
}

// ============================================================================
// Request
// ============================================================================

#[test]
fn pre_request_mutations_update_the_request() {
    let outcome = run(pre(
        r"
        hopp.request.setMethod('POST');
        hopp.request.setHeader('X-Trace', '1');
        pm.request.url.query.add({ key: 'limit', value: '10' });
        pm.request.url.query.upsert({ key: 'page', value: '2' });
        pm.request.headers.upsert({ key: 'x-trace', value: '2' });
        hopp.request.setBody({ contentType: 'application/json', body: '{}' });
        console.log(
            pm.request.url.query.get('page'),
            pm.request.url.query.count(),
            pm.request.headers.get('X-TRACE'),
            pm.request.url.getHost(),
            pm.request.url.getPath(),
        );
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["2 2 2 api.example.com /users"]
    );
    let request = &outcome.updated_request;
    assert_eq!(request.method, "POST");
    assert_eq!(request.endpoint, "https://api.example.com/users?page=2&limit=10");
    assert_eq!(request.headers.len(), 1);
    assert!(request.headers[0].key.eq_ignore_ascii_case("x-trace"));
    assert_eq!(request.headers[0].value, "2");
    assert_eq!(request.body["contentType"], json!("application/json"));
}

#[test]
fn query_list_helpers_and_assimilate() {
    let outcome = run(pre(
        r"
        const query = hopp.request.query;
        query.add({ key: 'tag', value: 'a' });
        query.add({ key: 'tag', value: 'b' });
        console.log(JSON.stringify(query.toObject()));
        query.append({ key: 'page', value: '3' });
        console.log(JSON.stringify(query.toObject()));
        console.log(query.has('tag'), query.idx(5), query.indexOf('tag'), query.find('page').value);
        query.assimilate({ only: 'this' }, true);
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec![
            r#"{"page":"1","tag":["a","b"]}"#,
            r#"{"tag":["a","b"],"page":"3"}"#,
            "true null 0 3",
        ]
    );
    assert_eq!(
        outcome.updated_request.endpoint,
        "https://api.example.com/users?only=this"
    );
}

#[test]
fn url_update_reparses_params() {
    let outcome = run(pre(
        r"
        pm.request.url.update('https://other.example.com:8443/a/b?x=1#frag');
        const url = pm.request.url;
        console.log(url.getRemote(), url.getPathWithQuery(), url.hash, pm.request.url.query.get('x'));
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["other.example.com:8443 /a/b?x=1 frag 1"]
    );
}

#[test]
fn request_is_read_only_in_test_scripts() {
    let failure = try_run(test_with_response("hopp.request.url = 'https://x';")).unwrap_err();
    assert_eq!(failure.message, "hopp.request.url is read-only");

    let outcome = run(test_with_response(
        r"
        console.log(
            typeof hopp.request.setUrl,
            typeof pm.request.url.query.add,
            typeof pm.request.headers.upsert,
            hopp.request.method,
        );
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["undefined undefined undefined GET"]
    );
}

// ============================================================================
// Tests and expectations
// ============================================================================

#[test]
fn legacy_expectations_build_a_tree() {
    let outcome = run(test_with_response(
        r"
        pw.test('Status', () => {
            pw.expect(pw.response.status).toBe(200);
            pw.expect(pw.response.status).toBeLevel2xx();
            pw.expect(pw.response.status).not.toBeLevel4xx();
            pw.expect('x').toBeType('strin');
        });
        ",
    ));
    let node = outcome.test_results.find("Status").expect("Status block");
    let statuses: Vec<ExpectStatus> = node.expect_results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExpectStatus::Pass,
            ExpectStatus::Pass,
            ExpectStatus::Pass,
            ExpectStatus::Error
        ]
    );
    assert_eq!(node.expect_results[0].message, "Expected '200' to be '200'");
}

#[test]
fn chai_expectations_record_pass_and_fail() {
    let outcome = run(test_with_response(
        r"
        hopp.test('Body', () => {
            hopp.expect(hopp.response.body.asJSON().name).to.equal('Ada');
            hopp.expect([1, 2, 3]).to.have.lengthOf(3);
            hopp.expect({ a: 1 }).to.have.property('a', 1);
            hopp.expect(5).to.be.at.least(10);
            hopp.expect(1).to.not.equal(2);
        });
        pm.test('pm', () => {
            pm.expect(pm.response.code).to.equal(200);
            pm.expect(pm.response.json().tags).to.include('x');
            pm.expect(pm.response.headers.get('content-type')).to.match(/json/);
            pm.expect({ b: [1] }).to.deep.equal({ b: [1] });
            pm.expect(() => { throw new TypeError('bad'); }).to.throw(TypeError);
        });
        ",
    ));
    let root = &outcome.test_results;
    assert_eq!(
        messages_with(root, ExpectStatus::Fail),
        vec!["Expected 5 to be at least 10"]
    );
    let passed = messages_with(root, ExpectStatus::Pass);
    assert_eq!(passed.len(), 9);
    assert!(passed.contains(&"Expected 'Ada' to equal 'Ada'".to_string()));
    assert!(passed.contains(&"Expected [1, 2, 3] to have lengthOf 3".to_string()));
    assert!(passed.contains(&"Expected {a: 1} to have property 'a', 1".to_string()));
    assert!(passed.contains(&"Expected 200 to equal 200".to_string()));
    assert!(passed.contains(&"Expected 'application/json' to match /json/".to_string()));
}

#[test]
fn object_state_and_predicate_assertions() {
    let outcome = run(test_with_response(
        r"
        pm.test('kinds', () => {
            pm.expect([1, 2]).to.be.instanceOf(Array);
            pm.expect('text').to.be.instanceof(Array);
            pm.expect({ run() {} }).to.respondTo('run');
            pm.expect({ run: 1 }).to.respondTo('run');
            pm.expect(7).to.satisfy((n) => n > 5);
            pm.expect(3).to.satisfy((n) => n > 5);
            pm.expect({}).to.be.extensible;
            pm.expect(Object.preventExtensions({})).to.not.be.extensible;
            pm.expect(Object.seal({})).to.be.sealed;
            pm.expect({ a: 1 }).to.be.sealed;
            pm.expect(Object.freeze({ a: 1 })).to.be.frozen;
            pm.expect({ a: 1 }).to.be.frozen;
            (function () {
                pm.expect(arguments).to.be.arguments;
            })();
            pm.expect([]).to.be.arguments;
        });
        ",
    ));
    let node = outcome.test_results.find("kinds").expect("kinds block");
    let results: Vec<(ExpectStatus, &str)> = node
        .expect_results
        .iter()
        .map(|result| (result.status, result.message.as_str()))
        .collect();
    assert_eq!(
        results,
        vec![
            (ExpectStatus::Pass, "Expected [1, 2] to be an instanceof Array"),
            (ExpectStatus::Fail, "Expected 'text' to be an instanceof Array"),
            (ExpectStatus::Pass, "Expected {run: undefined} to respondTo 'run'"),
            (ExpectStatus::Fail, "Expected {run: 1} to respondTo 'run'"),
            (ExpectStatus::Pass, "Expected 7 to satisfy"),
            (ExpectStatus::Fail, "Expected 3 to satisfy"),
            (ExpectStatus::Pass, "Expected {} to be extensible"),
            (ExpectStatus::Pass, "Expected {} to not be extensible"),
            (ExpectStatus::Pass, "Expected {} to be sealed"),
            (ExpectStatus::Fail, "Expected {a: 1} to be sealed"),
            (ExpectStatus::Pass, "Expected {a: 1} to be frozen"),
            (ExpectStatus::Fail, "Expected {a: 1} to be frozen"),
            (ExpectStatus::Pass, "Expected {} to be arguments"),
            (ExpectStatus::Fail, "Expected [] to be arguments"),
        ]
    );
}

#[test]
fn nested_blocks_are_children_and_open_blocks_close_on_throw() {
    let outcome = run(test_with_response(
        r"
        pw.test('outer', () => {
            pw.test('inner', () => {
                pw.expect(1).toBe(1);
            });
            pw.expect(2).toBe(3);
        });
        try {
            pw.test('broken', () => { throw new Error('inside'); });
        } catch (e) {
            console.log(e.message);
        }
        ",
    ));
    let root = &outcome.test_results;
    assert_eq!(root.children.len(), 2);
    let outer = &root.children[0];
    assert_eq!(outer.descriptor, "outer");
    assert_eq!(outer.children[0].descriptor, "inner");
    assert_eq!(root.children[1].descriptor, "broken");
    assert_eq!(
        expectations(root),
        vec![
            (ExpectStatus::Fail, "Expected '2' to be '3'".to_string()),
            (ExpectStatus::Pass, "Expected '1' to be '1'".to_string()),
        ]
    );
    assert_eq!(console_lines(&outcome.console_entries), vec!["inside"]);
}

#[test]
fn pre_request_scripts_have_no_test_api() {
    let outcome = run_pre(
        "console.log(typeof pw.test, typeof hopp.expect, typeof pm.response, pm.info.eventName);",
    );
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["undefined undefined undefined prerequest"]
    );
}

// ============================================================================
// Response
// ============================================================================

#[test]
fn response_views_agree() {
    let outcome = run(test_with_response(
        r"
        console.log(hopp.response.statusCode, hopp.response.statusText, pm.response.status);
        console.log(hopp.response.body.asText(), hopp.response.body.bytes().length);
        console.log(pm.response.headers.has('CONTENT-TYPE'), pm.response.headers.get('x-missing'));
        console.log(Object.isFrozen(hopp.response));
        ",
    ));
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec![
            "200 OK OK",
            r#"{"name":"Ada","tags":["x","y"]} 31"#,
            "true undefined",
            "true",
        ]
    );
}

#[test]
fn response_without_snapshot_is_undefined() {
    let outcome = run_test("console.log(typeof hopp.response, typeof pw.response);");
    assert_eq!(
        console_lines(&outcome.console_entries),
        vec!["undefined undefined"]
    );
}

// ============================================================================
// Globals
// ============================================================================

#[test]
fn base64_globals_and_console_levels() {
    let outcome = run_pre(
        r"
        console.info(btoa('hello'), atob('aGVsbG8='));
        console.warn('careful');
        try {
            btoa('☺');
        } catch (e) {
            console.error('btoa failed');
        }
        ",
    );
    let levels: Vec<ConsoleLevel> = outcome
        .console_entries
        .iter()
        .map(|entry| entry.level)
        .collect();
    assert_eq!(
        levels,
        vec![ConsoleLevel::Info, ConsoleLevel::Warn, ConsoleLevel::Error]
    );
    assert_eq!(console_lines(&outcome.console_entries)[0], "aGVsbG8= hello");
}

#[test]
fn outcome_serializes_in_camel_case() {
    let outcome = run_pre("pw.env.set('a', 'b');");
    let value = serde_json::to_value(&outcome).expect("serialize");
    assert!(value.get("updatedRequest").is_some());
    assert!(value.get("updatedEnvs").is_some());
    assert!(value.get("consoleEntries").is_some());
    assert_eq!(value["testResults"]["descriptor"], json!("root"));
}
