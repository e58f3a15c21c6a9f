//! Module closures called from the host, and their destructors.

mod common;

use hostlink::{BridgeConfig, CallSurface, HostEnvironment, HostFunction, HostValue, ModuleInstance};

use common::{loader, read_i32, ready};

const ADD_SLOT: i32 = 2;
const REENTER_SLOT: i32 = 3;
const DROP_SELF_SLOT: i32 = 4;
const INC_SLOT: i32 = 5;
const NOT_SLOT: i32 = 6;
const SAME_SLOT: i32 = 7;

fn make_closure(instance: &mut ModuleInstance, ctx: i32, slot: i32) -> (u32, HostFunction) {
    let handle = instance
        .call::<(i32, i32), i32>("make_closure", (ctx, slot))
        .unwrap()
        .value as u32;
    let function = instance
        .value(handle)
        .as_function()
        .cloned()
        .expect("closure handle holds a function");
    (handle, function)
}

#[test]
fn test_closure_forwards_arguments_and_result() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, add) = make_closure(instance, 10, ADD_SLOT);

    let result = instance.invoke(&add, &[HostValue::Number(1.5)]).unwrap();
    assert_eq!(result, HostValue::Number(11.5));

    let wrapper = add.as_closure().unwrap();
    assert_eq!(wrapper.count(), 1);
    assert_eq!(wrapper.dtor_index(), 1);
}

#[test]
fn test_module_drop_runs_destructor_once() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, add) = make_closure(instance, 10, ADD_SLOT);

    instance.call::<i32, ()>("drop_closure", 10).unwrap();
    assert_eq!(read_i32(instance, "dtor_count"), 1);
    assert!(add.as_closure().unwrap().is_torn_down());

    // The host copy is now inert and dropping it queues nothing
    let err = instance.invoke(&add, &[HostValue::Number(1.0)]).unwrap_err();
    assert!(err.to_string().contains("after being dropped"));
    drop(add);
    assert_eq!(instance.run_finalizers(), 0);
    assert_eq!(read_i32(instance, "dtor_count"), 1);
}

#[test]
fn test_drop_during_call_defers_destructor_to_call_end() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, drop_self) = make_closure(instance, 3, DROP_SELF_SLOT);

    instance.invoke(&drop_self, &[]).unwrap();
    assert_eq!(read_i32(instance, "dtor_count"), 1);
    assert!(drop_self.as_closure().unwrap().is_torn_down());

    drop(drop_self);
    instance.run_finalizers();
    assert_eq!(read_i32(instance, "dtor_count"), 1);
}

#[test]
fn test_reentrant_call_throws_and_is_caught() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, reenter) = make_closure(instance, 4, REENTER_SLOT);

    let result = instance.invoke(&reenter, &[HostValue::Number(1.0)]).unwrap();
    assert_eq!(result, HostValue::Undefined);

    let exception = instance.last_exception().expect("nested call recorded");
    assert!(exception.get("message").as_str().unwrap().contains("recursively"));

    // The outer call restored the context
    assert_eq!(reenter.as_closure().unwrap().count(), 1);
    assert!(!reenter.as_closure().unwrap().is_torn_down());
}

#[test]
fn test_host_drop_finalizes_once() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (handle, add) = make_closure(instance, 10, ADD_SLOT);

    // The module gives up its handle without tearing the closure down
    instance.call::<i32, ()>("release", handle as i32).unwrap();
    assert_eq!(read_i32(instance, "dtor_count"), 0);

    drop(add);
    assert_eq!(instance.state().pending_finalizers(), 1);
    assert_eq!(instance.run_finalizers(), 1);
    assert_eq!(read_i32(instance, "dtor_count"), 1);
    assert_eq!(instance.run_finalizers(), 0);
}

#[test]
fn test_finalizers_run_after_export_calls() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (handle, add) = make_closure(instance, 10, ADD_SLOT);
    drop(add);

    // Releasing the last reference inside a call; the call drains the queue
    instance.call::<i32, ()>("release", handle as i32).unwrap();
    assert_eq!(read_i32(instance, "dtor_count"), 1);
}

#[test]
fn test_finalization_can_be_disabled() {
    let config = BridgeConfig::default().finalization(false);
    let mut loader = common::loader_with(config, CallSurface::default(), HostEnvironment::new());
    let instance = ready(&mut loader);
    let (handle, add) = make_closure(instance, 10, ADD_SLOT);

    instance.call::<i32, ()>("release", handle as i32).unwrap();
    drop(add);
    assert_eq!(instance.run_finalizers(), 0);
    assert_eq!(read_i32(instance, "dtor_count"), 0);
}

#[test]
fn test_closure_handed_back_to_module() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (handle, _add) = make_closure(instance, 10, ADD_SLOT);

    // invoke1 calls the closure through the host with a boxed argument
    let arg = instance.box_value(HostValue::Number(2.0));
    let result = instance
        .call::<(i32, i32), i32>("call_with", (handle as i32, arg as i32))
        .unwrap()
        .value;
    assert_eq!(instance.value(result as u32), HostValue::Number(12.0));
}

#[test]
fn test_integer_closure_passes_numbers_by_value() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, inc) = make_closure(instance, 10, INC_SLOT);
    let live = instance.state().refs().live();

    let result = instance.invoke(&inc, &[HostValue::Number(41.0)]).unwrap();
    assert_eq!(read_i32(instance, "seen"), 41);
    assert_eq!(result, HostValue::Number(42.0));

    let result = instance.invoke(&inc, &[HostValue::Number(-5.0)]).unwrap();
    assert_eq!(read_i32(instance, "seen"), -5);
    assert_eq!(result, HostValue::Number(-4.0));

    // Nothing was boxed or taken from the table
    assert_eq!(instance.state().refs().live(), live);
}

#[test]
fn test_integer_result_leaves_table_slots_alone() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, inc) = make_closure(instance, 10, INC_SLOT);

    let kept = instance.box_value("keep me".into());
    let result = instance
        .invoke(&inc, &[HostValue::Number(f64::from(kept) - 1.0)])
        .unwrap();
    assert_eq!(result, HostValue::Number(f64::from(kept)));
    assert_eq!(instance.value(kept), HostValue::from("keep me"));
}

#[test]
fn test_boolean_closure_round_trip() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, not) = make_closure(instance, 10, NOT_SLOT);

    assert_eq!(
        instance.invoke(&not, &[HostValue::Bool(true)]).unwrap(),
        HostValue::Bool(false)
    );
    assert_eq!(read_i32(instance, "seen"), 1);
    assert_eq!(
        instance.invoke(&not, &[HostValue::Bool(false)]).unwrap(),
        HostValue::Bool(true)
    );
    assert_eq!(read_i32(instance, "seen"), 0);
}

#[test]
fn test_unsigned_closure_round_trip() {
    let mut loader = loader();
    let instance = ready(&mut loader);
    let (_, same) = make_closure(instance, 10, SAME_SLOT);

    let result = instance
        .invoke(&same, &[HostValue::Number(4_294_967_295.0)])
        .unwrap();
    assert_eq!(read_i32(instance, "seen"), -1);
    assert_eq!(result, HostValue::Number(4_294_967_295.0));
}
