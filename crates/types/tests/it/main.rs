//! Types IT tests

// unused deps lint confusion
#![allow(unused_crate_dependencies)]

use assert_matches::assert_matches;
use proptest::prelude::*;
use xic_types::{decode, encode, Arguments, Exception, Value};

#[test]
fn test_nested_arguments() {
    let inner = Arguments::new().with("pi", 3.5f64).with("bytes", vec![0u8, 255]);
    let args = Arguments::new()
        .with("inner", inner.clone())
        .with("list", Value::List(vec![Value::Null, Value::Int(-1), "s".into()]));

    let decoded: Arguments = decode(&encode(&args).unwrap()).unwrap();
    assert_eq!(decoded.get("inner").and_then(Value::as_dict), Some(&inner));
    assert_eq!(decoded, args);
}

#[test]
fn test_nan_survives_as_bits() {
    let bits = f64::NAN.to_bits();
    let decoded: Value = decode(&encode(&Value::Float(f64::NAN)).unwrap()).unwrap();
    assert_matches!(decoded, Value::Float(f) if f.to_bits() == bits);
}

proptest! {
    /// Whatever a servant raises, the caller sees the same name, code, tag, and message.
    #[test]
    fn prop_failure_payload_preserves_exception(
        exname in "[A-Za-z]{0,24}",
        code in any::<i64>(),
        tag in ".{0,16}",
        message in ".{0,64}",
    ) {
        let raised = Exception::new(exname.clone(), code, message.clone()).with_tag(tag.clone());
        let bytes = encode(&raised.to_failure("Method*Service")).unwrap();
        let remote = Exception::decode_failure(&bytes).unwrap();

        prop_assert_eq!(remote.exname(), exname.as_str());
        prop_assert_eq!(remote.code(), code);
        prop_assert_eq!(remote.tag(), tag.as_str());
        prop_assert_eq!(remote.message(), message.as_str());
    }
}
