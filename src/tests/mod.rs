use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use ndarray::prelude::*;

use crate::{
    backend::{Backend, Node},
    config::RuntimeConfig,
    dtype::DType,
    edsl::Program,
    error::{BridgeError, BridgeResult},
    exec::{Binding, Buffer, Compiler, Executable, ReferenceCompiler},
    function::{CompiledFunction, ShapeSignature},
};

/// Counts compilations and optionally fails the first few.
#[derive(Default)]
struct CountingCompiler {
    inner: ReferenceCompiler,
    compilations: AtomicUsize,
    failures_left: AtomicUsize,
}

impl CountingCompiler {
    fn failing(times: usize) -> Self {
        CountingCompiler {
            failures_left: AtomicUsize::new(times),
            ..CountingCompiler::default()
        }
    }

    fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

impl Compiler for CountingCompiler {
    fn compile(
        &self,
        program: &Program,
        device_id: Option<&str>,
        target: Option<&str>,
        input_bindings: Vec<Binding>,
        output_bindings: Vec<Binding>,
    ) -> BridgeResult<Arc<dyn Executable>> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BridgeError::compilation(program.name(), "device unavailable"));
        }
        self.inner
            .compile(program, device_id, target, input_bindings, output_bindings)
    }
}

fn backend_with(compiler: Arc<CountingCompiler>) -> Backend {
    crate::init_logging();
    Backend::new(RuntimeConfig::default(), compiler)
}

fn square_function(backend: &Backend) -> CompiledFunction {
    let x = backend
        .placeholder(Some(&[None, Some(4)]), None, None, Some("x"))
        .unwrap();
    let y = backend.square(&x);
    backend.function(&[x], &[y], &[], Some("square")).unwrap()
}

fn ones(rows: usize) -> Buffer {
    Buffer::new(DType::Float32, ArrayD::from_elem(IxDyn(&[rows, 4]), 1.5))
}

/// `rows x 4` buffer counting up from `start` in steps of 0.5.
fn ramp(rows: usize, start: f64) -> Buffer {
    let values = (0..rows * 4).map(|i| start + 0.5 * i as f64).collect();
    Buffer::from_vec(DType::Float32, &[rows, 4], values).unwrap()
}

fn squares(input: &Buffer) -> Vec<f64> {
    input.to_vec().iter().map(|v| v * v).collect()
}

#[test]
fn compiles_once_per_shape() {
    let compiler = Arc::new(CountingCompiler::default());
    let backend = backend_with(Arc::clone(&compiler));
    let square = square_function(&backend);

    let first_input = ramp(2, 1.0);
    let out = square.invoke(&[first_input.clone()]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dims(), &[2, 4]);
    assert_eq!(out[0].to_vec(), squares(&first_input));
    assert_eq!(compiler.compilations(), 1);

    let signature = square.signature_of(&[first_input]);
    assert_eq!(signature, ShapeSignature::from(vec![vec![2, 4]]));
    assert_eq!(signature.to_string(), "[(2, 4)]");
    let first = square.cached_executable(&signature).unwrap();

    // same dims, new contents: the cached executable must compute fresh values
    let second_input = ramp(2, -3.0);
    let out = square.invoke(&[second_input.clone()]).unwrap();
    assert_eq!(out[0].to_vec(), squares(&second_input));
    assert_ne!(out[0].to_vec(), squares(&ramp(2, 1.0)));
    assert_eq!(compiler.compilations(), 1);
    assert!(Arc::ptr_eq(
        &first,
        &square.cached_executable(&signature).unwrap()
    ));

    let third_input = ramp(3, 0.25);
    let out = square.invoke(&[third_input.clone()]).unwrap();
    assert_eq!(out[0].dims(), &[3, 4]);
    assert_eq!(out[0].to_vec(), squares(&third_input));
    assert_eq!(compiler.compilations(), 2);
    assert_eq!(square.cache_len(), 2);
    assert!(square.is_cached(&ShapeSignature::from(vec![vec![3, 4]])));

    // the earlier entry survives the new compilation untouched
    assert!(Arc::ptr_eq(
        &first,
        &square.cached_executable(&signature).unwrap()
    ));
    let fourth_input = ramp(2, 7.5);
    let out = square.invoke(&[fourth_input.clone()]).unwrap();
    assert_eq!(out[0].to_vec(), squares(&fourth_input));
    assert_eq!(compiler.compilations(), 2);
}

#[test]
fn wrong_arity_fails_before_compiling() {
    let compiler = Arc::new(CountingCompiler::default());
    let backend = backend_with(Arc::clone(&compiler));
    let square = square_function(&backend);
    assert_eq!(
        square.invoke(&[ones(2), ones(2)]),
        Err(BridgeError::Arity {
            function: "square".to_string(),
            expected: 1,
            actual: 2,
        })
    );
    assert_eq!(compiler.compilations(), 0);
    assert_eq!(square.cache_len(), 0);
}

#[test]
fn incompatible_shape_is_a_compilation_error() {
    let compiler = Arc::new(CountingCompiler::default());
    let backend = backend_with(Arc::clone(&compiler));
    let square = square_function(&backend);
    let wrong = Buffer::new(DType::Float32, ArrayD::zeros(IxDyn(&[2, 5])));
    assert!(matches!(
        square.invoke(&[wrong]),
        Err(BridgeError::Compilation { .. })
    ));
    assert_eq!(square.cache_len(), 0);
}

#[test]
fn failed_compilation_is_retried() {
    let compiler = Arc::new(CountingCompiler::failing(1));
    let backend = backend_with(Arc::clone(&compiler));
    let square = square_function(&backend);

    assert!(matches!(
        square.invoke(&[ones(2)]),
        Err(BridgeError::Compilation { .. })
    ));
    assert_eq!(square.cache_len(), 0);

    let out = square.invoke(&[ones(2)]).unwrap();
    assert_eq!(out[0].dims(), &[2, 4]);
    assert_eq!(compiler.compilations(), 2);
    assert_eq!(square.cache_len(), 1);
}

#[test]
fn runtime_failure_keeps_executable() {
    let compiler = Arc::new(CountingCompiler::default());
    let backend = backend_with(Arc::clone(&compiler));
    let x = backend
        .placeholder(None, Some(1), Some("int32"), Some("x"))
        .unwrap();
    let y = backend
        .placeholder(None, Some(1), Some("int32"), Some("y"))
        .unwrap();
    let quotient = backend.div(&x, &y).unwrap();
    let divide = backend
        .function(&[x, y], &[quotient], &[], Some("divide"))
        .unwrap();

    let lhs = Buffer::from_vec(DType::Int32, &[2], vec![6., 8.]).unwrap();
    let zero = Buffer::from_vec(DType::Int32, &[2], vec![3., 0.]).unwrap();
    assert!(matches!(
        divide.invoke(&[lhs.clone(), zero]),
        Err(BridgeError::RuntimeExecution { .. })
    ));
    assert_eq!(divide.cache_len(), 1);

    let rhs = Buffer::from_vec(DType::Int32, &[2], vec![3., 4.]).unwrap();
    assert_eq!(divide.invoke(&[lhs, rhs]).unwrap()[0].to_vec(), vec![2., 2.]);
    assert_eq!(compiler.compilations(), 1);
}

#[test]
fn concurrent_callers_share_one_compilation() {
    let compiler = Arc::new(CountingCompiler::default());
    let backend = backend_with(Arc::clone(&compiler));
    let square = square_function(&backend);

    crossbeam::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|_| {
                let out = square.invoke(&[ones(5)]).unwrap();
                assert_eq!(out[0].dims(), &[5, 4]);
            });
        }
    })
    .unwrap();

    assert_eq!(compiler.compilations(), 1);
    assert_eq!(square.cache_len(), 1);
}

#[test]
fn updates_write_back_to_variables() {
    let backend = Backend::reference(RuntimeConfig::default());
    let counter = backend
        .variable(Array::from_elem(IxDyn(&[2]), 0.0), None, Some("counter"))
        .unwrap();
    let x = backend.placeholder(None, Some(1), None, Some("x")).unwrap();
    let next = backend.add(&counter, &x).unwrap();
    let doubled = backend.mul(&counter, 2.0).unwrap();
    let step = backend
        .function(&[x], &[doubled], &[(counter.clone(), next)], Some("accumulate"))
        .unwrap();

    let feed = Buffer::from_vec(DType::Float32, &[2], vec![1., 2.]).unwrap();
    // outputs see the value from before the update
    assert_eq!(step.invoke(&[feed.clone()]).unwrap()[0].to_vec(), vec![0., 0.]);
    assert_eq!(step.invoke(&[feed]).unwrap()[0].to_vec(), vec![2., 4.]);
    assert_eq!(read_variable(&counter), vec![2., 4.]);
    assert_eq!(step.output_count(), 1);
    assert_eq!(step.cache_len(), 1);
}

fn read_variable(node: &Node) -> Vec<f64> {
    node.tensor()
        .variable_storage()
        .unwrap()
        .read()
        .unwrap()
        .to_vec()
}

#[test]
fn update_target_must_be_a_variable() {
    let backend = Backend::reference(RuntimeConfig::default());
    let x = backend.placeholder(None, Some(1), None, Some("x")).unwrap();
    let y = backend.neg(&x);
    assert!(matches!(
        backend.function(&[x.clone()], &[], &[(x, y)], None),
        Err(BridgeError::InvalidArgument { .. })
    ));
}

#[test]
fn outputs_are_stamped_with_the_device() {
    let config = RuntimeConfig::default()
        .with_device_id("cpu:0")
        .with_target("llvm_cpu");
    let backend = Backend::reference(config);
    let x = backend.placeholder(None, Some(2), None, None).unwrap();
    let mean = backend.mean(&x, Some(&[-1]), false).unwrap();
    let rowmean = backend.function(&[x], &[mean], &[], None).unwrap();
    let out = rowmean
        .invoke(&[Buffer::from_array(
            DType::Float32,
            array![[1., 3.], [2., 6.]],
        )])
        .unwrap();
    assert_eq!(out[0].to_vec(), vec![2., 4.]);
    assert_eq!(out[0].device_id(), Some("cpu:0"));
}

#[test]
fn unknown_target_never_caches() {
    let config = RuntimeConfig::default().with_target("tpu");
    let backend = Backend::reference(config);
    let x = backend.placeholder(None, Some(1), None, None).unwrap();
    let y = backend.exp(&x);
    let f = backend.function(&[x], &[y], &[], None).unwrap();
    let input = Buffer::from_vec(DType::Float32, &[1], vec![0.]).unwrap();
    assert!(f.invoke(&[input.clone()]).is_err());
    assert!(f.invoke(&[input]).is_err());
    assert_eq!(f.cache_len(), 0);
}

#[test]
fn failed_update_leaves_every_variable_unchanged() {
    let backend = Backend::reference(RuntimeConfig::default());
    let total = backend
        .variable(Array::from_elem(IxDyn(&[2]), 1.0), None, Some("total"))
        .unwrap();
    let last = backend
        .variable(Array::from_elem(IxDyn(&[2]), 0.0), None, Some("last"))
        .unwrap();
    let x = backend.placeholder(None, Some(1), None, Some("x")).unwrap();
    let next_total = backend.add(&total, &x).unwrap();
    let next_last = backend.mul(&x, 2.0).unwrap();
    let step = backend
        .function(
            &[x],
            &[],
            &[(total.clone(), next_total), (last.clone(), next_last)],
            Some("track"),
        )
        .unwrap();

    let storage = Arc::clone(last.tensor().variable_storage().unwrap());
    let poisoned = std::thread::spawn(move || {
        let _guard = storage.write().unwrap();
        panic!("writer died holding the lock");
    })
    .join();
    assert!(poisoned.is_err());

    let feed = Buffer::from_vec(DType::Float32, &[2], vec![3., 4.]).unwrap();
    assert!(matches!(
        step.invoke(&[feed]),
        Err(BridgeError::RuntimeExecution { .. })
    ));
    assert_eq!(read_variable(&total), vec![1., 1.]);
}

#[test]
fn variable_cannot_be_updated_twice() {
    let backend = Backend::reference(RuntimeConfig::default());
    let w = backend.variable(vec![1.0, 2.0], None, Some("w")).unwrap();
    let doubled = backend.mul(&w, 2.0).unwrap();
    let halved = backend.div(&w, 2.0).unwrap();
    assert!(matches!(
        backend.function(&[], &[], &[(w.clone(), doubled), (w, halved)], None),
        Err(BridgeError::InvalidArgument { .. })
    ));
}
