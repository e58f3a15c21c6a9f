//! Generated adapters for call surface entries.

mod common;

use hostlink::{
    ArgShape, BridgeConfig, BridgeError, CallSurface, HostEnvironment, HostValue, Loader,
    ModuleInstance, PlainObject, RetShape, SurfaceEntry, SyncSource, Target, Thrown, ViewKind,
};

const IMPORTS: &str = r#"
  (import "hostlink" "get_length" (func $get_length (param i32) (result i32)))
  (import "hostlink" "sum_f64" (func $sum_f64 (param i32 i32) (result f64)))
  (import "hostlink" "fill_random" (func $fill_random (param i32 i32)))
  (import "hostlink" "new_context" (func $new_context (result i32)))
  (import "hostlink" "state_of" (func $state_of (param i32) (result i32)))
  (import "hostlink" "is_ready" (func $is_ready (param i32) (result i32)))
  (import "hostlink" "greet" (func $greet (param i32 i32 i32)))
  (import "hostlink" "maybe_num" (func $maybe_num (param i32 i32)))
  (import "hostlink" "set_label" (func $set_label (param i32 i32)))
  (import "hostlink" "boom" (func $boom))
"#;

const BODY: &str = r#"
  (func (export "length_of") (param i32) (result i32) (call $get_length (local.get 0)))
  (func (export "sum") (param i32 i32) (result f64) (call $sum_f64 (local.get 0) (local.get 1)))
  (func (export "fill") (param i32 i32) (call $fill_random (local.get 0) (local.get 1)))
  (func (export "new_context") (result i32) (call $new_context))
  (func (export "state_of") (param i32) (result i32) (call $state_of (local.get 0)))
  (func (export "is_ready") (param i32) (result i32) (call $is_ready (local.get 0)))
  (func (export "greet") (param i32 i32 i32) (call $greet (local.get 0) (local.get 1) (local.get 2)))
  (func (export "maybe_num") (param i32 i32) (call $maybe_num (local.get 0) (local.get 1)))
  (func (export "set_label") (param i32 i32) (call $set_label (local.get 0) (local.get 1)))
  (func (export "boom") (call $boom))
"#;

fn surface() -> CallSurface {
    use ArgShape::*;
    CallSurface::empty()
        .entry(SurfaceEntry::new("get_length", Target::Get("length".into())).params([Ref]).ret(RetShape::I32))
        .entry(SurfaceEntry::new("sum_f64", Target::Call("sum".into())).params([Slice(ViewKind::Float64)]).ret(RetShape::F64))
        .entry(SurfaceEntry::new("fill_random", Target::Call("crypto.getRandomValues".into())).params([SliceMut(ViewKind::Uint8)]))
        .entry(SurfaceEntry::new("new_context", Target::Construct("AudioContext".into())).ret(RetShape::Ref).catching())
        .entry(
            SurfaceEntry::new("state_of", Target::Get("state".into()))
                .params([Ref])
                .ret(RetShape::Enum(vec!["suspended".into(), "running".into(), "closed".into()])),
        )
        .entry(SurfaceEntry::new("is_ready", Target::Get("ready".into())).params([Ref]).ret(RetShape::OptBool))
        .entry(SurfaceEntry::new("greet", Target::Call("greet".into())).params([Str]).ret(RetShape::Str))
        .entry(SurfaceEntry::new("maybe_num", Target::Get("num".into())).params([Ref]).ret(RetShape::OptF64))
        .entry(SurfaceEntry::new("set_label", Target::Set("label".into())).params([Ref, Ref]))
        .entry(SurfaceEntry::new("boom", Target::Call("boom".into())))
}

fn host() -> HostEnvironment {
    HostEnvironment::new()
        .function("sum", |_, args| {
            let array = args.first().and_then(HostValue::as_array).ok_or_else(|| Thrown::type_error("expected array"))?;
            Ok(HostValue::Number(array.to_numbers().iter().sum()))
        })
        .function("greet", |_, args| {
            let name = args.first().and_then(HostValue::as_str).unwrap_or("nobody");
            Ok(HostValue::String(format!("hello, {name}")))
        })
        .function("boom", |_, _| Err(Thrown::error("Error", "kaboom")))
}

fn load(host: HostEnvironment) -> Loader {
    let mut loader = common::loader_with(BridgeConfig::default(), surface(), host);
    let bytes = wat::parse_str(common::module_text(IMPORTS, BODY)).unwrap();
    loader.init_sync(SyncSource::Bytes(bytes.into())).unwrap();
    loader
}

fn instance(loader: &mut Loader) -> &mut ModuleInstance {
    loader.instance().unwrap()
}

fn read_pair(instance: &mut ModuleInstance, retptr: u32) -> (u32, usize) {
    let words = instance.read_array::<u32>(retptr, 2).unwrap();
    (words[0], words[1] as usize)
}

#[test]
fn test_property_read_of_string_length() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let h = instance.box_value("héllo €".into());
    let len = instance.call::<i32, i32>("length_of", h as i32).unwrap().value;
    assert_eq!(len, 7);
}

#[test]
fn test_slice_argument_is_copied_in() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let (ptr, len) = instance.pass_array(&[1.0f64, 2.5, 3.5]).unwrap();
    let sum = instance
        .call::<(i32, i32), f64>("sum", (ptr as i32, len as i32))
        .unwrap()
        .value;
    assert_eq!(sum, 7.0);
}

#[test]
fn test_mutable_slice_is_written_back() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let (ptr, len) = instance.pass_array(&[0u8; 48]).unwrap();
    instance
        .call::<(i32, i32), ()>("fill", (ptr as i32, len as i32))
        .unwrap();
    let bytes = instance.read_array::<u8>(ptr, len).unwrap();
    assert!(bytes.iter().any(|b| *b != 0));
}

#[test]
fn test_construct_missing_class_is_caught() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let handle = instance.call::<(), i32>("new_context", ()).unwrap().value;
    assert_eq!(handle, 0);

    let exception = instance.last_exception().unwrap();
    assert_eq!(exception.get("name"), HostValue::from("ReferenceError"));
    assert!(exception.get("message").as_str().unwrap().contains("AudioContext"));
}

#[test]
fn test_construct_uses_prefixed_fallback() {
    let host = host().function("webkitAudioContext", |_, _| {
        Ok(HostValue::object(
            PlainObject::with_class("AudioContext").prop("state", "running"),
        ))
    });
    let mut loader = load(host);
    let instance = instance(&mut loader);

    let handle = instance.call::<(), i32>("new_context", ()).unwrap().value;
    assert_ne!(handle, 0);
    let context = instance.value(handle as u32);
    assert_eq!(context.class_name(), "AudioContext");
    assert!(instance.last_exception().is_none());

    assert_eq!(instance.call::<i32, i32>("state_of", handle).unwrap().value, 1);
}

#[test]
fn test_unknown_enum_value_maps_past_the_end() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let odd = instance.box_value(HostValue::object(PlainObject::new().prop("state", "interrupted")));
    assert_eq!(instance.call::<i32, i32>("state_of", odd as i32).unwrap().value, 3);
}

#[test]
fn test_optional_bool_encoding() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let ready = instance.box_value(HostValue::object(PlainObject::new().prop("ready", true)));
    let unknown = instance.box_value(HostValue::object(PlainObject::new()));

    assert_eq!(instance.call::<i32, i32>("is_ready", ready as i32).unwrap().value, 1);
    assert_eq!(
        instance.call::<i32, i32>("is_ready", unknown as i32).unwrap().value,
        0xFF_FFFF
    );
}

#[test]
fn test_string_result_through_return_pointer() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let (ptr, len) = instance.pass_string("wörld").unwrap();
    instance
        .call::<(i32, i32, i32), ()>("greet", (0, ptr as i32, len as i32))
        .unwrap();
    let (out_ptr, out_len) = read_pair(instance, 0);
    assert_eq!(instance.read_string(out_ptr, out_len).unwrap(), "hello, wörld");
}

#[test]
fn test_optional_number_through_return_pointer() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let with = instance.box_value(HostValue::object(PlainObject::new().prop("num", 4.25)));
    let without = instance.box_value(HostValue::object(PlainObject::new()));

    instance.call::<(i32, i32), ()>("maybe_num", (0, with as i32)).unwrap();
    assert_eq!(instance.read_array::<u32>(0, 1).unwrap()[0], 1);
    assert_eq!(instance.read_array::<f64>(8, 1).unwrap()[0], 4.25);

    instance.call::<(i32, i32), ()>("maybe_num", (0, without as i32)).unwrap();
    assert_eq!(instance.read_array::<u32>(0, 1).unwrap()[0], 0);
}

#[test]
fn test_property_write() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    let object = HostValue::object(PlainObject::new());
    let target = instance.box_value(object.clone());
    let label = instance.box_value("left".into());

    instance
        .call::<(i32, i32), ()>("set_label", (target as i32, label as i32))
        .unwrap();
    assert_eq!(object.get("label"), HostValue::from("left"));

    // Writing through undefined is a TypeError and this entry does not catch
    let err = instance
        .call::<(i32, i32), ()>("set_label", (0, label as i32))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Uncaught(_)));
}

#[test]
fn test_uncaught_host_exception_traps() {
    let mut loader = load(host());
    let instance = instance(&mut loader);
    match instance.call::<(), ()>("boom", ()) {
        Err(BridgeError::Uncaught(thrown)) => assert_eq!(thrown.to_string(), "Error: kaboom"),
        other => panic!("expected uncaught exception, got {other:?}"),
    }
}

#[test]
fn test_surface_json_round_trip_links() {
    let json = surface().to_json().unwrap();
    let parsed = CallSurface::from_json(&json).unwrap();
    assert_eq!(parsed, surface());
}

#[test]
fn test_surface_rejects_reserved_prefix() {
    let bad = CallSurface::empty().entry(SurfaceEntry::new("__hostlink_log", Target::Call("console.log".into())));
    assert!(matches!(bad.validate(), Err(BridgeError::Config(_))));
    assert!(Loader::new(BridgeConfig::default())
        .unwrap()
        .with_surface(bad)
        .init_sync(SyncSource::Bytes(wat::parse_str("(module (memory (export \"memory\") 1))").unwrap().into()))
        .is_err());
}
