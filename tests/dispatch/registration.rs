//! The three registration shapes resolve to the same thing.

use remote_fn::{
    CallRequest, FunctionKey, Handler, Registration, RegistrationError, Registry, RemoteFunction,
};
use serde_json::json;

use crate::functions::{add, greeting, record, withdraw};

#[test]
fn annotated_function_stays_callable() {
    assert_eq!(add::call(2, 3), 5);
    assert_eq!(greeting::call("pat".into(), Some("!".into())), "hello pat!");
    assert_eq!(add::NAME, "add");
    assert_eq!(greeting::NAME, "greet");
}

#[test]
fn bare_annotation_uses_function_name() {
    let mut registry = Registry::with_namespace("math");
    let function = registry.register(add).unwrap();
    assert_eq!(function.subject(), "math.add");
    assert!(function.handler().is_blocking());
}

#[test]
fn parameterized_annotation_applies_options() {
    let mut registry = Registry::with_namespace("math");
    assert_eq!(registry.register(greeting).unwrap().subject(), "math.greet");
    assert_eq!(registry.register(withdraw).unwrap().subject(), "bank.withdraw");

    let audit = registry.register(record).unwrap();
    assert_eq!(audit.subject(), "audit.js.record");
    assert!(audit.is_durable());
}

#[test]
fn shapes_are_equivalent_to_direct_registration() {
    let mut direct = Registry::with_namespace("math");
    direct
        .register_handler(
            Registration::new().name("add"),
            Handler::blocking(|req| Ok(json!(req.bind::<i64>(0, "a")? + req.bind::<i64>(1, "b")?))),
        )
        .unwrap();

    let mut annotated = Registry::with_namespace("math");
    annotated.register(add).unwrap();

    let key = FunctionKey::new("math", "add", false);
    assert_eq!(direct.get(&key).unwrap().key(), annotated.get(&key).unwrap().key());

    // Either way the key is taken afterwards.
    let err = annotated
        .register_handler(Registration::new().name("add"), Handler::blocking(|_| Ok(json!(0))))
        .unwrap_err();
    assert_eq!(err, RegistrationError::Duplicate("math.add".to_string()));
}

#[test]
fn overrides_win_over_declared_options() {
    let mut registry = Registry::new();
    registry
        .register_with(Registration::new().namespace("ledger").durable(false), record)
        .unwrap();
    assert!(registry.resolve("ledger.record").is_some());
}

#[tokio::test]
async fn generated_handlers_bind_arguments() {
    let mut registry = Registry::new();
    let greet = registry.register(greeting).unwrap();

    let result = greet
        .invoke(CallRequest::new().kwarg("name", "sam"))
        .await
        .unwrap();
    assert_eq!(result, json!("hello sam"));

    let err = greet
        .invoke(CallRequest::new().arg("sam").kwarg("shout", true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "TypeError");

    let err = greet.invoke(CallRequest::new()).await.unwrap_err();
    assert!(err.message_text().contains("missing required argument 'name'"));
}
