use std::time::{Duration, Instant};

use kestrel_script::marshal::MarshalError;
use kestrel_script::{
    AbortHandle, AbortReason, AccessFlags, BuildState, FunctionRef, Handle, InvokeError, RunSetup, ScriptExecutor,
    ScriptModule, Value,
};
use rhai::{EvalAltResult, NativeCallContext};

struct Counter {
    hits: u32,
}

struct Unregistered;

fn executor() -> ScriptExecutor {
    ScriptExecutor::builder()
        .register_object::<Counter>("Counter", true)
        .with_engine(|engine| {
            engine.register_get("hits", |counter: &mut Handle<Counter>| counter.hits as i64);
        })
        .build()
        .expect("executor")
}

fn module(executor: &ScriptExecutor, code: &str) -> Handle<ScriptModule> {
    let module = executor.create_module("Invoke", "tests");
    module.add_source_segment("invoke.rhai", 1, code);
    module
}

fn echo(executor: &ScriptExecutor) -> FunctionRef {
    module(executor, "fn echo(x) { x }").function("echo", 1).expect("echo")
}

#[test]
fn integers_round_trip_through_scripts() {
    let executor = executor();
    let echo = echo(&executor);
    let setup = RunSetup::new("echo");

    for value in [i8::MIN, -1, 0, i8::MAX] {
        assert_eq!(executor.invoke::<i8>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [i16::MIN, i16::MAX] {
        assert_eq!(executor.invoke::<i16>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [i32::MIN, i32::MAX] {
        assert_eq!(executor.invoke::<i32>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [i64::MIN, i64::MAX] {
        assert_eq!(executor.invoke::<i64>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [u8::MIN, u8::MAX] {
        assert_eq!(executor.invoke::<u8>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [u16::MIN, u16::MAX] {
        assert_eq!(executor.invoke::<u16>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [u32::MIN, u32::MAX] {
        assert_eq!(executor.invoke::<u32>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
    for value in [0u64, i64::MAX as u64] {
        assert_eq!(executor.invoke::<u64>(&echo, &[value.into()], &setup).unwrap(), Some(value));
    }
}

#[test]
fn u64_beyond_script_range_is_a_mismatch() {
    let executor = executor();
    let echo = echo(&executor);
    let err = executor.invoke::<u64>(&echo, &[u64::MAX.into()], &RunSetup::new("echo")).unwrap_err();
    assert!(matches!(err, InvokeError::TypeMismatch { index: 0, source: MarshalError::OutOfRange { .. }, .. }));
}

#[test]
fn narrowing_a_return_value_is_checked() {
    let executor = executor();
    let echo = echo(&executor);
    let err = executor.invoke::<u8>(&echo, &[300i32.into()], &RunSetup::new("echo")).unwrap_err();
    assert!(matches!(err, InvokeError::ReturnTypeMismatch { .. }));
}

#[test]
fn floats_bools_chars_and_strings_pass_through() {
    let executor = executor();
    let echo = echo(&executor);
    let setup = RunSetup::new("echo");
    assert_eq!(executor.invoke::<f64>(&echo, &[2.5f64.into()], &setup).unwrap(), Some(2.5));
    assert_eq!(executor.invoke::<f32>(&echo, &[0.25f32.into()], &setup).unwrap(), Some(0.25));
    assert_eq!(executor.invoke::<bool>(&echo, &[true.into()], &setup).unwrap(), Some(true));
    assert_eq!(executor.invoke::<char>(&echo, &['k'.into()], &setup).unwrap(), Some('k'));
    assert_eq!(executor.invoke::<String>(&echo, &["text".into()], &setup).unwrap().as_deref(), Some("text"));
}

#[test]
fn object_handles_gain_a_reference_for_the_call() {
    let executor = executor();
    let module = module(&executor, "fn hits(counter) { counter.hits }\nfn keep(counter) { counter }");
    let counter = Handle::new(Counter { hits: 3 });

    let hits = module.function("hits", 1).unwrap();
    let result = executor.invoke::<i64>(&hits, &[Value::object(counter.clone())], &RunSetup::new("hits")).unwrap();
    assert_eq!(result, Some(3));
    assert_eq!(Handle::ref_count(&counter), 1);

    let keep = module.function("keep", 1).unwrap();
    let returned = executor
        .invoke::<Handle<Counter>>(&keep, &[Value::object(counter.clone())], &RunSetup::new("keep"))
        .unwrap()
        .expect("handle returned");
    assert!(Handle::ptr_eq(&returned, &counter));
    assert_eq!(Handle::ref_count(&counter), 2);
}

#[test]
fn unregistered_objects_abort_before_running() {
    let executor = executor();
    let module = module(&executor, "fn pair(a, b) { a }");
    let pair = module.function("pair", 2).unwrap();
    let args = [1i32.into(), Value::object(Handle::new(Unregistered))];
    let err = executor.invoke::<i64>(&pair, &args, &RunSetup::new("pair")).unwrap_err();
    assert!(matches!(err, InvokeError::TypeMismatch { index: 1, source: MarshalError::Unregistered(_), .. }));
    assert_eq!(executor.stats().invocations, 0);
}

#[test]
fn argument_count_is_checked_and_extras_ignored() {
    let executor = executor();
    let module = module(&executor, "fn add(a, b) { a + b }");
    let add = module.function("add", 2).unwrap();
    let setup = RunSetup::new("add");
    let err = executor.invoke::<i64>(&add, &[1i32.into()], &setup).unwrap_err();
    assert_eq!(err, InvokeError::ArgumentCount { function: "add".into(), expected: 2, provided: 1 });
    let sum = executor.invoke::<i64>(&add, &[1i32.into(), 2i32.into(), 99i32.into()], &setup).unwrap();
    assert_eq!(sum, Some(3));
}

#[test]
fn unit_returns_are_none() {
    let executor = executor();
    let module = module(&executor, "fn nothing() { }");
    let mut setup = RunSetup::new("nothing");
    assert_eq!(executor.run::<i64>(&module, &mut setup, &[]).unwrap(), None);
    assert_eq!(executor.run::<()>(&module, &mut setup, &[]).unwrap(), None);
}

#[test]
fn runaway_scripts_time_out() {
    let executor = executor();
    let module = module(&executor, "fn spin() { let x = 0; loop { x += 1; } }");
    let mut setup = RunSetup::new("spin").with_timeout(Duration::from_millis(50)).quiet();
    let started = Instant::now();
    let err = executor.run::<i64>(&module, &mut setup, &[]).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.is_abort());
    assert!(matches!(err, InvokeError::Aborted { reason: AbortReason::Timeout(_), .. }));
}

#[test]
fn host_abort_stops_a_running_script() {
    let abort = AbortHandle::new();
    let trigger = abort.clone();
    let executor = ScriptExecutor::builder()
        .with_engine(move |engine| {
            engine.register_fn("stop_me", move || trigger.abort());
        })
        .build()
        .expect("executor");
    let module = module(&executor, "fn run() { stop_me(); let x = 0; loop { x += 1; } }");
    let mut setup = RunSetup::new("run").with_abort(abort.clone());
    let err = executor.run::<i64>(&module, &mut setup, &[]).unwrap_err();
    assert!(matches!(err, InvokeError::Aborted { reason: AbortReason::Requested, .. }));

    abort.reset();
    let module = self::module(&executor, "fn fine() { 5 }");
    let mut setup = RunSetup::new("fine").with_abort(abort);
    assert_eq!(executor.run::<i64>(&module, &mut setup, &[]).unwrap(), Some(5));
}

#[test]
fn exceptions_map_back_to_segment_lines() {
    let executor = executor();
    let module = executor.create_module("Segments", "tests");
    module.add_source_segment("first.rhai", 1, "fn helper() {\n  1\n}");
    module.add_source_segment("second.rhai", 40, "fn explode() {\n  let x = 1;\n  throw \"boom\";\n}");
    let mut setup = RunSetup::new("explode").quiet();
    let err = executor.run::<i64>(&module, &mut setup, &[]).unwrap_err();
    let exception = err.exception().expect("exception");
    assert!(exception.message.contains("boom"));
    let origin = exception.origin().expect("origin frame");
    assert_eq!(origin.function, "explode");
    assert_eq!(origin.file, "second.rhai");
    assert_eq!(origin.line, Some(42));
    assert!(exception.report().contains("second.rhai:42"));
}

#[test]
fn restricted_host_functions_check_the_calling_module() {
    let builder = ScriptExecutor::builder().restrict("peek", AccessFlags::FULL_FILE_SYSTEM);
    let grants = builder.access_grants();
    let executor = builder
        .with_engine(move |engine| {
            engine.register_fn("peek", move |context: NativeCallContext| -> Result<i64, Box<EvalAltResult>> {
                grants.require(&context, "peek", AccessFlags::FULL_FILE_SYSTEM)?;
                Ok(7)
            });
        })
        .build()
        .expect("executor");

    let direct = module(&executor, "fn run() { peek() }");
    let err = executor.run::<i64>(&direct, &mut RunSetup::new("run").quiet(), &[]).unwrap_err();
    assert!(matches!(err, InvokeError::ModuleUnusable { state: BuildState::Failed, .. }));

    let indirect = module(&executor, "fn run() { let f = Fn(\"peek\"); f.call() }");
    let err = executor.run::<i64>(&indirect, &mut RunSetup::new("run").quiet(), &[]).unwrap_err();
    assert!(err.exception().is_some_and(|exception| exception.message.contains("FullFileSystem")));

    let trusted = module(&executor, "fn run() { let f = Fn(\"peek\"); f.call() }");
    trusted.add_access(AccessFlags::FULL_FILE_SYSTEM);
    assert_eq!(executor.run::<i64>(&trusted, &mut RunSetup::new("run"), &[]).unwrap(), Some(7));
}
