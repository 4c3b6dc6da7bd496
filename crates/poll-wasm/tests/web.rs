//! Browser-binding tests. Run with `wasm-pack test --node`.

#![cfg(target_arch = "wasm32")]

use js_sys::{Array, Function, Object, Reflect};
use poll_wasm::{JsMedium, JsStore, WasmPeer};
use wasm_bindgen::JsValue;
use wasm_bindgen_test::*;

/// A `JsStore` over a plain object, plus the object for inspection.
fn object_store() -> (JsStore, Object) {
    let backing = Object::new();
    let get = Function::new_with_args("key", "return Object.prototype.hasOwnProperty.call(this, key) ? this[key] : null;")
        .bind(&backing);
    let set = Function::new_with_args("key, value", "this[key] = String(value);").bind(&backing);
    let remove = Function::new_with_args("key", "delete this[key];").bind(&backing);
    (JsStore::new(get, set, remove), backing)
}

/// A `JsMedium` that appends every posted text to an array.
fn array_medium() -> (JsMedium, Array) {
    let sent = Array::new();
    let post = Function::new_with_args("text", "this.push(text);").bind(&sent);
    (JsMedium::new(post), sent)
}

/// `JsError` has no `Debug`, so unwrap through `JsValue`.
fn ok<T>(result: Result<T, wasm_bindgen::JsError>) -> T {
    result.map_err(JsValue::from).unwrap()
}

fn options(namespace: &str) -> JsValue {
    let options = Object::new();
    Reflect::set(&options, &"namespace".into(), &namespace.into()).unwrap();
    Reflect::set(&options, &"endpoint".into(), &"/api/poll".into()).unwrap();
    options.into()
}

fn value(store: &Object, key: &str) -> Option<String> {
    Reflect::get(store, &key.into()).unwrap().as_string()
}

fn effect_types(effects: &JsValue) -> Vec<String> {
    Array::from(effects)
        .iter()
        .map(|e| Reflect::get(&e, &"type".into()).unwrap().as_string().unwrap())
        .collect()
}

fn find_effect(effects: &JsValue, kind: &str) -> Option<JsValue> {
    Array::from(effects)
        .iter()
        .find(|e| Reflect::get(e, &"type".into()).unwrap().as_string().as_deref() == Some(kind))
}

#[wasm_bindgen_test]
fn first_peer_takes_the_lock_and_polls() {
    let (store, backing) = object_store();
    let (medium, _) = array_medium();
    let peer = ok(WasmPeer::new(options("t1_"), store, medium));

    let effects = ok(peer.start());

    let types = effect_types(&effects);
    assert!(types.contains(&"poll".to_string()));
    assert!(types.contains(&"activeChanged".to_string()));
    assert!(peer.is_active());
    assert_eq!(peer.peer_count(), 1.0);
    assert_eq!(value(&backing, "t1_in_work").as_deref(), Some("true"));
    assert_eq!(value(&backing, "t1__Tabs").as_deref(), Some("1"));

    let poll = find_effect(&effects, "poll").unwrap();
    let request = Reflect::get(&poll, &"request".into()).unwrap();
    assert_eq!(Reflect::get(&request, &"peerCount".into()).unwrap().as_f64(), Some(1.0));
}

#[wasm_bindgen_test]
fn poll_result_is_broadcast_and_delivered() {
    let (store, _) = object_store();
    let (medium, sent) = array_medium();
    let peer = ok(WasmPeer::new(options("t2_"), store, medium));
    let effects = ok(peer.start());
    let poll = find_effect(&effects, "poll").unwrap();
    let attempt = Reflect::get(&poll, &"attempt".into()).unwrap().as_f64().unwrap();

    let data = Object::new();
    Reflect::set(&data, &"events".into(), &3.into()).unwrap();
    let effects = ok(peer.poll_succeeded(attempt, data.into()));

    let types = effect_types(&effects);
    assert!(types.contains(&"deliver".to_string()));
    assert!(types.contains(&"startTimer".to_string()));
    assert_eq!(sent.length(), 1);
    let text = sent.get(0).as_string().unwrap();
    assert!(text.contains("\"type\":\"newData\""));
    assert!(text.contains("\"events\":3"));
}

#[wasm_bindgen_test]
fn follower_delivers_received_data() {
    let (store, _) = object_store();
    let (medium, _) = array_medium();
    let peer = ok(WasmPeer::new(options("t3_"), store, medium));
    ok(peer.start());

    let effects = ok(peer.message_received(r#"{"type":"newData","data":{"events":[1,2]}}"#));
    let deliver = find_effect(&effects, "deliver").unwrap();
    let data = Reflect::get(&deliver, &"data".into()).unwrap();
    assert_eq!(Array::from(&Reflect::get(&data, &"events".into()).unwrap()).length(), 2);

    assert_eq!(Array::from(&ok(peer.message_received("not json"))).length(), 0);
    assert_eq!(Array::from(&ok(peer.message_received(r#"{"type":"other"}"#))).length(), 0);
}

#[wasm_bindgen_test]
fn teardown_releases_lock_and_count() {
    let (store, backing) = object_store();
    let (medium, _) = array_medium();
    let peer = ok(WasmPeer::new(options("t4_"), store, medium));
    ok(peer.start());

    let effects = ok(peer.teardown());

    assert!(effect_types(&effects).contains(&"cancelTimer".to_string()));
    assert!(!peer.is_active());
    assert!(!peer.is_running());
    assert_eq!(value(&backing, "t4_in_work").as_deref(), Some("false"));
    assert_eq!(value(&backing, "t4__Tabs").as_deref(), Some("0"));
    assert_eq!(Array::from(&ok(peer.teardown())).length(), 0);
}

#[wasm_bindgen_test]
fn invalid_options_are_rejected() {
    let (store, _) = object_store();
    let (medium, _) = array_medium();
    assert!(WasmPeer::new(options(""), store, medium).is_err());
}
