//! Shared fixtures for integration tests.

#![allow(dead_code)]

use hostlink::{BridgeConfig, CallSurface, HostEnvironment, Loader, ModuleInstance, SyncSource};

/// Bump allocator exported under the bridge names. Grows memory on demand.
pub const ALLOCATOR: &str = r#"
  (global $heap (mut i32) (i32.const 1024))

  (func $malloc (export "__hostlink_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local.set $ptr
      (i32.and
        (i32.add (global.get $heap) (i32.sub (local.get $align) (i32.const 1)))
        (i32.sub (i32.const 0) (local.get $align))))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.gt_u (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
      (then
        (drop (memory.grow
          (i32.add
            (i32.div_u
              (i32.sub (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
              (i32.const 65536))
            (i32.const 1))))))
    (global.set $heap (local.get $end))
    (local.get $ptr))
"#;

/// Reallocator that always moves.
pub const REALLOCATOR: &str = r#"
  (func $realloc (export "__hostlink_realloc")
    (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
    (local $dst i32)
    (local.set $dst (call $malloc (local.get $new) (local.get $align)))
    (memory.copy
      (local.get $dst)
      (local.get $ptr)
      (select (local.get $old) (local.get $new) (i32.lt_u (local.get $old) (local.get $new))))
    (local.get $dst))
"#;

/// Module exercising intrinsics, closures, and the error channel.
///
/// Function table slots: 1 destructor, 2 `(f64) -> f64` adder, 3 closure
/// that re-enters itself through `invoke1`, 4 closure that drops itself
/// while running, 5 `(i32) -> i32` increment, 6 `(bool) -> bool` negation,
/// 7 `(u32) -> u32` identity. Shape descriptors sit at `32 + 4 * (slot - 2)`;
/// slot 4 passes an empty descriptor.
pub const FIXTURE_IMPORTS: &str = r#"
  (import "hostlink" "__hostlink_init_ref_table" (func $init_ref_table (result i32)))
  (import "hostlink" "__hostlink_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "hostlink" "__hostlink_number_new" (func $number_new (param f64) (result i32)))
  (import "hostlink" "__hostlink_closure_new" (func $closure_new (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "hostlink" "__hostlink_cb_drop" (func $cb_drop (param i32) (result i32)))
  (import "hostlink" "__hostlink_ref_drop" (func $ref_drop (param i32)))
  (import "hostlink" "__hostlink_string_get" (func $string_get (param i32 i32)))
  (import "hostlink" "__hostlink_number_get" (func $number_get (param i32 i32)))
  (import "hostlink" "__hostlink_boolean_get" (func $boolean_get (param i32) (result i32)))
  (import "hostlink" "__hostlink_is_string" (func $is_string (param i32) (result i32)))
  (import "hostlink" "__hostlink_throw" (func $throw (param i32 i32)))
  (import "hostlink" "__hostlink_random_fill" (func $random_fill (param i32 i32)))
  (import "hostlink" "console_log" (func $console_log (param i32 i32)))
  (import "hostlink" "global_this" (func $global_this (result i32)))
  (import "hostlink" "invoke1" (func $invoke1 (param i32 i32) (result i32)))
"#;

pub const FIXTURE_BODY: &str = r#"
  (global $exn (mut i32) (i32.const 0))
  (global $dtor_count (mut i32) (i32.const 0))
  (global $init_count (mut i32) (i32.const 0))
  (global $undefined (mut i32) (i32.const 0))
  (global $self (mut i32) (i32.const 0))
  (global $seen (mut i32) (i32.const 0))

  (data (i32.const 16) "hello from start")
  (data (i32.const 32) "d:d\00r:r\00\00\00\00\00i:i\00b:b\00u:u")

  (table (export "__indirect_function_table") 8 funcref)
  (elem (i32.const 1)
    $closure_dtor $closure_add $closure_reenter $closure_drop_self
    $closure_inc $closure_not $closure_same)

  (func (export "__hostlink_exn_store") (param $h i32)
    (global.set $exn (local.get $h)))

  (func (export "__hostlink_start")
    (global.set $undefined (call $init_ref_table))
    (global.set $init_count (i32.add (global.get $init_count) (i32.const 1))))

  (func (export "start")
    (call $console_log (i32.const 16) (i32.const 16)))

  (func (export "init_count") (result i32) (global.get $init_count))
  (func (export "undefined_handle") (result i32) (global.get $undefined))
  (func (export "last_exn") (result i32) (global.get $exn))
  (func (export "dtor_count") (result i32) (global.get $dtor_count))
  (func (export "seen") (result i32) (global.get $seen))

  (func (export "grow") (param $pages i32) (result i32)
    (memory.grow (local.get $pages)))

  (func (export "make_string") (param $ptr i32) (param $len i32) (result i32)
    (call $string_new (local.get $ptr) (local.get $len)))

  (func (export "make_number") (param $n f64) (result i32)
    (call $number_new (local.get $n)))

  (func (export "string_len") (param $h i32) (result i32)
    (call $string_get (i32.const 0) (local.get $h))
    (i32.load (i32.const 4)))

  (func (export "number_or") (param $h i32) (param $default f64) (result f64)
    (call $number_get (i32.const 0) (local.get $h))
    (if (result f64) (i32.load (i32.const 0))
      (then (f64.load (i32.const 8)))
      (else (local.get $default))))

  (func (export "bool_of") (param $h i32) (result i32)
    (call $boolean_get (local.get $h)))

  (func (export "is_string") (param $h i32) (result i32)
    (call $is_string (local.get $h)))

  (func (export "fail")
    (call $throw (i32.const 16) (i32.const 5)))

  (func (export "fill_random") (param $ptr i32) (param $len i32)
    (call $random_fill (local.get $ptr) (local.get $len)))

  (func (export "global_handle") (result i32)
    (call $global_this))

  (func (export "call_with") (param $callee i32) (param $arg i32) (result i32)
    (call $invoke1 (local.get $callee) (local.get $arg)))

  (func (export "make_closure") (param $ctx i32) (param $slot i32) (result i32)
    (global.set $self
      (call $closure_new
        (local.get $ctx) (i32.const 7) (i32.const 1) (local.get $slot)
        (i32.add (i32.const 32) (i32.mul (i32.const 4) (i32.sub (local.get $slot) (i32.const 2))))
        (select (i32.const 0) (i32.const 3) (i32.eq (local.get $slot) (i32.const 4)))))
    (global.get $self))

  (func (export "drop_closure") (param $ctx i32)
    (if (call $cb_drop (global.get $self))
      (then (call $closure_dtor (local.get $ctx) (i32.const 7)))))

  (func (export "release") (param $h i32)
    (call $ref_drop (local.get $h)))

  (func $closure_dtor (param $ctx i32) (param $lifetime i32)
    (global.set $dtor_count (i32.add (global.get $dtor_count) (i32.const 1))))

  (func $closure_add (param $ctx i32) (param $lifetime i32) (param $x f64) (result f64)
    (f64.add (local.get $x) (f64.convert_i32_u (local.get $ctx))))

  (func $closure_reenter (param $ctx i32) (param $lifetime i32) (param $arg i32) (result i32)
    (call $invoke1 (global.get $self) (local.get $arg)))

  (func $closure_drop_self (param $ctx i32) (param $lifetime i32)
    (drop (call $cb_drop (global.get $self))))

  (func $closure_inc (param $ctx i32) (param $lifetime i32) (param $x i32) (result i32)
    (global.set $seen (local.get $x))
    (i32.add (local.get $x) (i32.const 1)))

  (func $closure_not (param $ctx i32) (param $lifetime i32) (param $b i32) (result i32)
    (global.set $seen (local.get $b))
    (i32.eqz (local.get $b)))

  (func $closure_same (param $ctx i32) (param $lifetime i32) (param $x i32) (result i32)
    (global.set $seen (local.get $x))
    (local.get $x))
"#;

/// Assemble a module from imports, the allocator, and a body.
pub fn module_text(imports: &str, body: &str) -> String {
    format!(
        "(module {imports} (memory (export \"memory\") 1) {ALLOCATOR} {REALLOCATOR} {body})"
    )
}

/// The main fixture as binary.
pub fn fixture_bytes() -> Vec<u8> {
    wat::parse_str(module_text(FIXTURE_IMPORTS, FIXTURE_BODY)).expect("fixture should parse")
}

/// A loader over the default configuration and surface.
pub fn loader() -> Loader {
    Loader::new(BridgeConfig::default()).expect("loader should build")
}

/// A loader with a custom host environment.
pub fn loader_with(config: BridgeConfig, surface: CallSurface, host: HostEnvironment) -> Loader {
    Loader::new(config)
        .expect("loader should build")
        .with_surface(surface)
        .with_host(host)
}

/// Synchronously instantiate the main fixture.
pub fn ready(loader: &mut Loader) -> &mut ModuleInstance {
    loader
        .init_sync(SyncSource::Bytes(fixture_bytes().into()))
        .expect("fixture should instantiate")
}

/// Read an `i32` export with no arguments.
pub fn read_i32(instance: &mut ModuleInstance, name: &str) -> i32 {
    instance
        .call::<(), i32>(name, ())
        .expect("export should be callable")
        .value
}
