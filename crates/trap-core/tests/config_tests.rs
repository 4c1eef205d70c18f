//! Configuration tests for Trap core

use trap_core::{Configuration, CONFIG_HASH, ENDPOINT_ID, OPTION_MAX_CHUNK_SIZE};

#[test]
fn test_handshake_body_roundtrip() {
    let mut body = Configuration::new();
    body.set_option(ENDPOINT_ID, "NEW");
    body.set_option(OPTION_MAX_CHUNK_SIZE, 16384);
    body.set_option(CONFIG_HASH, "0123456789abcdef0123456789abcdef");

    let parsed = Configuration::parse(&body.to_string());

    assert_eq!(parsed, body);
    assert_eq!(parsed.int_option(OPTION_MAX_CHUNK_SIZE, 0), 16384);
}

#[test]
fn test_serialization_is_sorted() {
    let cfg = Configuration::parse("z = 1\na = 2\nm = 3");
    assert_eq!(cfg.to_string(), "a = 2\nm = 3\nz = 1\n");
}

#[test]
fn test_merge_overwrites() {
    let mut base = Configuration::parse("a = 1\nb = 2");
    base.merge(&Configuration::parse("b = 20\nc = 30"));

    assert_eq!(base.option("a"), Some("1"));
    assert_eq!(base.option("b"), Some("20"));
    assert_eq!(base.option("c"), Some("30"));
}

#[test]
fn test_merge_text_keeps_existing() {
    let mut cfg = Configuration::parse("a = 1");
    cfg.merge_text("b = 2");
    assert_eq!(cfg.len(), 2);
}

#[test]
fn test_prefixed_lookup() {
    let cfg = Configuration::parse("trap.transport.socket.port = 4001");
    assert_eq!(cfg.option_in("trap.transport.socket", "port"), Some("4001"));

    let mut other = Configuration::new();
    other.set_option_in("trap.transport.socket", "port", 4001);
    assert_eq!(other, cfg);
}

#[test]
fn test_value_may_contain_equals() {
    let cfg = Configuration::parse("url = http://host/?a=b");
    assert_eq!(cfg.option("url"), Some("http://host/?a=b"));
}

#[test]
fn test_digest_changes_with_values() {
    let a = Configuration::parse("trap.transport.loopback.address = one");
    let b = Configuration::parse("trap.transport.loopback.address = two");
    assert_ne!(a.digest(), b.digest());
    assert_eq!(a.digest(), a.clone().digest());
}
