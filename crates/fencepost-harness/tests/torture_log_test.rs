//! End-to-end checks: option strings built by `env` parse back, and torture
//! logs validate line by line.

use fencepost_core::{DebugFlags, Options, TokenStyle};
use fencepost_harness::env_cmd::{self, EnvRequest};
use fencepost_harness::structured_log::{LogEmitter, LogLevel, validate_log_line};
use fencepost_harness::{HarnessError, TortureConfig, torture};

#[test]
fn composed_options_parse_back_in_every_style() {
    let req = EnvRequest {
        tag: Some("low".into()),
        plus: vec!["log-trans".into()],
        interval: Some(25),
        log: Some("/tmp/fp.%p.log".into()),
        address: Some("0xdead0:4".into()),
        ..EnvRequest::default()
    };
    let change = env_cmd::apply(Options::default(), &req).unwrap();
    for style in [TokenStyle::Hex, TokenStyle::Long, TokenStyle::Short] {
        let text = env_cmd::render(&change.options, style);
        let back = Options::parse(&text).unwrap();
        assert_eq!(back, change.options, "style {style:?}: {text}");
    }
    assert!(
        change
            .options
            .flags_or_empty()
            .contains(DebugFlags::LOG_TRANS | DebugFlags::ERROR_ABORT)
    );
}

#[test]
fn torture_log_is_valid_jsonl() {
    let mut emitter = LogEmitter::new(Vec::new(), "it");
    emitter.emit(LogLevel::Info, "torture_start").unwrap();
    let config = TortureConfig {
        seed: 0x5EED,
        iterations: 300,
        max_live: 32,
        arena_bytes: 16 << 20,
        check_every: 50,
        ..TortureConfig::default()
    };
    let report = torture::run(&config, Some(&mut emitter)).unwrap();
    let text = String::from_utf8(emitter.into_inner()).unwrap();
    let mut ops = 0;
    for (n, line) in text.lines().enumerate() {
        let entry = validate_log_line(line, n + 1).unwrap();
        assert_eq!(entry.run_id.as_deref(), Some("it"));
        if entry.event == "heap_op" {
            ops += 1;
            assert!(entry.pointer().is_some());
        }
    }
    assert_eq!(ops, 300);
    assert_eq!(report.stats.calls.free, report.frees);
}

#[test]
fn exhausted_arena_is_reported_with_the_op() {
    let config = TortureConfig {
        seed: 1,
        iterations: 5_000,
        max_live: 10_000,
        max_size: 64 * 4096,
        arena_bytes: 1 << 20,
        check_every: 0,
        flags: DebugFlags::empty(),
    };
    let err = torture::run::<Vec<u8>>(&config, None).unwrap_err();
    assert!(matches!(err, HarnessError::Torture { op, .. } if op > 0));
}
