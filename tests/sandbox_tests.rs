//! Sandbox executor through its public API: hostile candidates, runaway
//! programs and resource caps.

use std::time::{Duration, Instant};

use rstest::rstest;
use skill_evolver::sandbox::{deny_list_check, DenyReason, Limits, Sandbox, SandboxConfig, SandboxError};

fn wrap(body: &str) -> String {
    format!("fn summarizer(text, max_len)\n{body}\nend\n")
}

#[rstest]
#[case("import os\nreturn text")]
#[case("return open(\"/etc/passwd\")")]
#[case("let x = __class__\nreturn text")]
#[case("return subprocess(text)")]
#[case("return eval(text)")]
#[case("return replace_all(text, \"(a+)+$\", \"\")")]
fn test_hostile_candidates_never_compile(#[case] body: &str) {
    let src = wrap(body);
    assert!(deny_list_check(&src).is_some(), "{body}");
    assert!(Sandbox::default().compile_candidate(&src, "summarizer").is_none());
}

#[test]
fn test_file_open_reason() {
    let src = wrap("return open(text)");
    assert!(matches!(deny_list_check(&src), Some(DenyReason::FileAccess(_))));
}

#[test]
fn test_runtime_built_nested_quantifier_is_refused() {
    // The pattern only exists once the call runs, so the static gate cannot
    // see it.
    let src = wrap(
        "let p = \"(a\" + \"+)\" + \"+b\"\nif len(text) > 10\nreturn str(matches(text, p))\nend\nreturn text",
    );
    let sb = Sandbox::default();
    let c = sb.compile_candidate(&src, "summarizer").expect("canary input is short");
    let start = Instant::now();
    let err = sb
        .try_invoke(&c, &"a".repeat(5_000), 10, Duration::from_secs(2))
        .unwrap_err();
    assert!(matches!(err, SandboxError::Denied(DenyReason::NestedQuantifier(_))), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_string_growth_hits_resource_limit() {
    let src = wrap("let s = text\nwhile len(s) < max_len\ns = s + s\nend\nreturn s");
    let sb = Sandbox::default();
    let c = sb.compile_candidate(&src, "summarizer").unwrap();
    let err = sb.try_invoke(&c, "ab", 10_000_000, Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, SandboxError::ResourceLimit(_)), "{err:?}");
}

#[test]
fn test_list_growth_hits_resource_limit() {
    let src = wrap("let xs = []\nwhile true\nxs = push(xs, 1)\nend\nreturn text");
    let sb = Sandbox::new(SandboxConfig { canary_timeout: Duration::from_secs(2), ..SandboxConfig::default() });
    let err = sb.try_compile(&src, "summarizer").unwrap_err();
    assert!(
        matches!(err, SandboxError::ResourceLimit(_) | SandboxError::StepBudgetExhausted | SandboxError::Timeout),
        "{err:?}"
    );
}

#[test]
fn test_step_budget_is_configurable() {
    let src = wrap("let i = 0\nwhile i < max_len\ni = i + 1\nend\nreturn text");
    let tight = Sandbox::new(SandboxConfig {
        limits: Limits { max_steps: 2_000, ..Limits::default() },
        ..SandboxConfig::default()
    });
    let c = tight.compile_candidate(&src, "summarizer").expect("64 iterations fit");
    assert_eq!(
        tight.try_invoke(&c, "x", 100_000, Duration::from_secs(5)).unwrap_err(),
        SandboxError::StepBudgetExhausted
    );
}

#[test]
fn test_doubling_big_strings_is_stopped_by_memory_budget() {
    let src = wrap(
        "if len(text) < 1000\nreturn text\nend\n\
         let xs = [text, text, text, text, text, text, text, text]\n\
         let i = 0\nwhile i < 6\nxs = xs + xs\ni = i + 1\nend\nreturn join(xs, \"\")",
    );
    let sb = Sandbox::default();
    let c = sb.compile_candidate(&src, "summarizer").unwrap();
    let start = Instant::now();
    let err = sb
        .try_invoke(&c, &"m".repeat(512 * 1024), 10, Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err, SandboxError::ResourceLimit("memory"));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_memory_budget_is_configurable() {
    let src = wrap("let a = text + text\nlet b = a + a\nreturn take(b, max_len)");
    let tight = Sandbox::new(SandboxConfig {
        limits: Limits { max_alloc_bytes: 100_000, ..Limits::default() },
        ..SandboxConfig::default()
    });
    let c = tight.compile_candidate(&src, "summarizer").expect("canary input is tiny");
    assert_eq!(tight.call(&c, &"w".repeat(1_000), 50).map(|s| s.len()), Some(50));
    assert_eq!(
        tight.try_invoke(&c, &"w".repeat(20_000), 50, Duration::from_secs(2)).unwrap_err(),
        SandboxError::ResourceLimit("memory")
    );
}

#[test]
fn test_deep_recursion_is_capped() {
    let src = "fn down(n, acc)\nreturn down(n + 1, acc)\nend\nfn summarizer(text, max_len)\nif len(text) > 4\nreturn down(0, text)\nend\nreturn text\nend\n";
    let sb = Sandbox::default();
    let c = sb.compile_candidate(src, "summarizer").unwrap();
    assert_eq!(sb.call(&c, "longer text", 10), None);
}

#[test]
fn test_helper_functions_and_lists() {
    let src = "fn shout(s, n)\nreturn upper(take(s, n))\nend\n\
               fn summarizer(text, max_len)\n\
               let words = find_all(text, \"[a-z]+\")\n\
               let out = []\n\
               for w in words\nout = push(out, shout(w, 1))\nend\n\
               return take(join(out, \"\"), max_len)\nend\n";
    let sb = Sandbox::default();
    let c = sb.compile_candidate(src, "summarizer").unwrap();
    assert_eq!(sb.call(&c, "keep it simple stupid", 3).as_deref(), Some("KIS"));
}

#[test]
fn test_timeout_is_a_normal_outcome() {
    let src = wrap("let i = 0\nwhile i < max_len\ni = i + 1\nend\nreturn text");
    let sb = Sandbox::default();
    let c = sb.compile_candidate(&src, "summarizer").unwrap();
    let start = Instant::now();
    assert_eq!(sb.invoke(&c, "x", i64::MAX, Duration::from_millis(20)), None);
    assert!(start.elapsed() < Duration::from_secs(2));
}
