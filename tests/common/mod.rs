#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use v77broker::bridge::{InstanceFactory, InvokeError, MemberInvoker, ObjectRef, TypeRef, Variant};
use v77broker::ConnectionTarget;

/// Recording stand-in for the automation server
///
/// Implements both bridge traits. Every call is appended to `calls` as
/// `Member(arg, arg)`; results are scripted through the setters.
#[derive(Default)]
pub struct FakeServer {
    calls: Mutex<Vec<String>>,
    fail_resolve: AtomicBool,
    initialize_result: Mutex<Option<Variant>>,
    values: Mutex<HashMap<String, Variant>>,
    failing: Mutex<HashSet<String>>,
    initialize_gate: Gate,
    open_form_gate: Gate,
    open_form_delay: Mutex<Duration>,
    created: AtomicUsize,
    released: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_resolve(&self, fail: bool) {
        self.fail_resolve.store(fail, Ordering::SeqCst);
    }

    pub fn set_initialize_result(&self, value: impl Into<Variant>) {
        *self.initialize_result.lock().unwrap() = Some(value.into());
    }

    /// Value returned by `Get(key)`
    pub fn set_value(&self, key: &str, value: impl Into<Variant>) {
        self.values.lock().unwrap().insert(key.to_string(), value.into());
    }

    /// Make every call to `member` fail
    pub fn fail_member(&self, member: &str) {
        self.failing.lock().unwrap().insert(member.to_string());
    }

    /// Make `Initialize` block until [`FakeServer::release_initialize`]
    pub fn block_initialize(&self) {
        self.initialize_gate.close();
    }

    pub fn release_initialize(&self) {
        self.initialize_gate.open();
    }

    /// Make `OpenForm` block until [`FakeServer::release_open_form`]
    pub fn block_open_form(&self) {
        self.open_form_gate.close();
    }

    pub fn release_open_form(&self) {
        self.open_form_gate.open();
    }

    /// Make every `OpenForm` take `delay`
    pub fn set_open_form_delay(&self, delay: Duration) {
        *self.open_form_delay.lock().unwrap() = delay;
    }

    /// Most external calls ever observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Poll until `member` has been called `count` times
    pub async fn wait_for_calls(&self, member: &str, count: usize) {
        while self.calls_named(member).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, member: &str) -> Vec<String> {
        let prefix = format!("{member}(");
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(&prefix))
            .collect()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn record(&self, member: &str, args: &[Variant]) {
        let args = args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
        self.calls.lock().unwrap().push(format!("{member}({args})"));
    }
}

impl InstanceFactory for FakeServer {
    fn resolve_type(&self, prog_id: &str) -> Result<TypeRef, InvokeError> {
        self.record("ResolveType", &[prog_id.into()]);
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(InvokeError::new(format!("ProgID '{prog_id}' is not registered")));
        }
        Ok(TypeRef::new(prog_id, ()))
    }

    fn create_instance(&self, ty: &TypeRef) -> Result<ObjectRef, InvokeError> {
        self.record("CreateInstance", &[ty.name().into()]);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ObjectRef::new(ty.name(), ()))
    }

    fn release_instance(&self, object: ObjectRef) {
        self.record("ReleaseInstance", &[object.name().into()]);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeServer {
    fn dispatch(&self, name: &str, args: &[Variant]) -> Result<Variant, InvokeError> {
        if self.failing.lock().unwrap().contains(name) {
            return Err(InvokeError::new(format!("'{name}' failed")));
        }

        match name {
            "Initialize" => {
                self.initialize_gate.wait();
                Ok(self
                    .initialize_result
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or(Variant::Bool(true)))
            }
            "CreateObject" => Ok(Variant::Object(ObjectRef::new("ValueList", ()))),
            "OpenForm" => {
                self.open_form_gate.wait();
                std::thread::sleep(*self.open_form_delay.lock().unwrap());
                Ok(Variant::Null)
            }
            "AddValue" => Ok(Variant::Null),
            "Get" => {
                let key = args.first().and_then(Variant::as_str).unwrap_or_default();
                Ok(self.values.lock().unwrap().get(key).cloned().unwrap_or_default())
            }
            other => Err(InvokeError::new(format!("Unknown method '{other}'"))),
        }
    }
}

impl MemberInvoker for FakeServer {
    fn invoke_method(&self, _target: &ObjectRef, name: &str, args: &[Variant]) -> Result<Variant, InvokeError> {
        self.record(name, args);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let result = self.dispatch(name, args);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        result
    }

    fn get_property(&self, _target: &ObjectRef, name: &str) -> Result<Variant, InvokeError> {
        self.record(name, &[]);
        match name {
            "RMTrade" => Ok(Variant::Int(1)),
            other => Err(InvokeError::new(format!("Unknown property '{other}'"))),
        }
    }
}

/// Blocks callers while closed
#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.changed.notify_all();
    }

    fn wait(&self) {
        let mut closed = self.closed.lock().unwrap();
        while *closed {
            closed = self.changed.wait(closed).unwrap();
        }
    }
}

pub fn target() -> ConnectionTarget {
    ConnectionTarget::new("/srv/bases/trade", "TestUser", Some("TestPassword".to_string())).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
