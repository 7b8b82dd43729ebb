//! Lifecycle of one automation server instance
//!
//! A [`Connection`] owns the external object for a single
//! [`ConnectionTarget`] and moves it through:
//!
//! ```text
//! Fresh -> TypeResolved -> Created -> Initialized
//! ```
//!
//! with an orthogonal error budget that, once exhausted, turns every entry
//! point into a fast `TooManyErrors` rejection. All access to the external
//! object is serialized by one async mutex because the server is
//! single-threaded.
//!
//! Teardown is debounced: [`Connection::dispose`] arms a grace deadline and
//! any later call pushes it back, so back-to-back callers reuse the instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::circuit::ErrorBudget;
use super::idle::{self, IdleTimer};
use crate::bridge::{call_method, read_property, InstanceFactory, MemberInvoker, ObjectRef, TypeRef};
use crate::error::{Error, Result};
use crate::target::ConnectionTarget;

const TRADE_MODE_PROPERTY: &str = "RMTrade";
const INITIALIZE_METHOD: &str = "Initialize";
const NO_SPLASH_FLAG: &str = "NO_SPLASH_SHOW";
const CREATE_OBJECT_METHOD: &str = "CreateObject";
const VALUE_LIST_TYPE: &str = "ValueList";
const ADD_VALUE_METHOD: &str = "AddValue";
const OPEN_FORM_METHOD: &str = "OpenForm";
const REPORT_FORM: &str = "Report";
const GET_METHOD: &str = "Get";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Runtime settings shared by every connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Registered identifier of the automation server
    pub component_id: String,

    /// Initialization timeout when the target has no override
    pub initialize_timeout: Duration,

    /// Idle grace period before a disposed connection is torn down
    pub dispose_grace: Duration,

    /// Failures tolerated before the connection rejects every call
    pub max_errors: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            component_id: "V77.Application".to_string(),
            initialize_timeout: Duration::from_secs(30),
            dispose_grace: Duration::from_secs(5),
            max_errors: 3,
        }
    }
}

/// Observable lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing created yet
    Fresh,

    /// Type resolved, instance not created
    TypeResolved,

    /// Instance created, not initialized
    Created,

    /// Ready to run units of work
    Initialized,

    /// Error budget exhausted
    Rejecting,

    /// Torn down or being torn down
    Disposed,
}

#[derive(Default)]
struct ConnectionInner {
    com_type: Option<TypeRef>,
    com_object: Option<ObjectRef>,
    initialized: bool,
    disposed: bool,
}

type InnerGuard = OwnedMutexGuard<ConnectionInner>;

/// Parameters of one unit of work, owned so they can cross into the blocking pool
struct RunRequest {
    relative_path: String,
    context: Vec<(String, String)>,
    result_key: Option<String>,
    error_key: Option<String>,
}

/// The external calls made on behalf of a connection
///
/// Every method here blocks on the automation server and must run off the
/// async executor, with the connection lock held by the caller.
struct ServerHandle {
    target: ConnectionTarget,
    component_id: String,
    instance_factory: Arc<dyn InstanceFactory>,
    invoker: Arc<dyn MemberInvoker>,
}

impl ServerHandle {
    /// Resolve the type and create the instance, reusing whatever already exists
    fn create_instance(&self, inner: &mut ConnectionInner) -> Result<ObjectRef> {
        let com_type = match &inner.com_type {
            Some(com_type) => com_type.clone(),
            None => {
                let com_type = self
                    .instance_factory
                    .resolve_type(&self.component_id)
                    .map_err(|source| Error::ResolveType {
                        prog_id: self.component_id.clone(),
                        source,
                    })?;
                inner.com_type = Some(com_type.clone());
                com_type
            }
        };

        if let Some(com_object) = &inner.com_object {
            return Ok(com_object.clone());
        }

        let com_object = self
            .instance_factory
            .create_instance(&com_type)
            .map_err(|source| Error::CreateInstance {
                type_name: com_type.name().to_string(),
                source,
            })?;
        inner.com_object = Some(com_object.clone());
        Ok(com_object)
    }

    fn initialize(&self, com_object: &ObjectRef, cancel: &CancellationToken) -> Result<()> {
        let invoker = self.invoker.as_ref();

        ensure_not_cancelled(cancel)?;
        let trade_mode = read_property(invoker, com_object, TRADE_MODE_PROPERTY)?;

        ensure_not_cancelled(cancel)?;
        let args = [trade_mode, self.target.connection_string().into(), NO_SPLASH_FLAG.into()];

        let result = call_method(invoker, com_object, INITIALIZE_METHOD, &args)?;
        match result.as_bool() {
            Some(true) => Ok(()),
            Some(false) => Err(Error::InitializeReturnedFalse {
                address: self.target.address().to_string(),
            }),
            None => Err(Error::UnexpectedValue {
                member: INITIALIZE_METHOD.to_string(),
                value: result.to_string(),
            }),
        }
    }

    fn run_unit_of_work(
        &self,
        inner: &ConnectionInner,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let com_object = inner
            .com_object
            .as_ref()
            .ok_or(Error::NotReady("COM object is not created"))?;
        if !inner.initialized {
            return Err(Error::NotReady("COM object is not connected to infobase"));
        }

        let invoker = self.invoker.as_ref();

        let created = call_method(invoker, com_object, CREATE_OBJECT_METHOD, &[VALUE_LIST_TYPE.into()])?;
        let value_list = match created.as_object() {
            Some(value_list) => value_list.clone(),
            None => {
                return Err(Error::UnexpectedValue {
                    member: CREATE_OBJECT_METHOD.to_string(),
                    value: created.to_string(),
                })
            }
        };

        for (key, value) in &request.context {
            ensure_not_cancelled(cancel)?;
            call_method(
                invoker,
                &value_list,
                ADD_VALUE_METHOD,
                &[value.as_str().into(), key.as_str().into()],
            )?;
        }

        ensure_not_cancelled(cancel)?;

        let full_path = self.target.resolve_path(&request.relative_path);
        call_method(
            invoker,
            com_object,
            OPEN_FORM_METHOD,
            &[REPORT_FORM.into(), value_list.clone().into(), full_path.into()],
        )?;

        if let Some(error_key) = &request.error_key {
            ensure_not_cancelled(cancel)?;
            let message = call_method(invoker, &value_list, GET_METHOD, &[error_key.as_str().into()])?;
            if !message.is_null() {
                return Err(Error::UnitOfWorkReported {
                    address: self.target.address().to_string(),
                    message: message.to_string(),
                });
            }
        }

        let Some(result_key) = &request.result_key else {
            return Ok(None);
        };

        ensure_not_cancelled(cancel)?;
        let result = call_method(invoker, &value_list, GET_METHOD, &[result_key.as_str().into()])?;
        Ok((!result.is_null()).then(|| result.to_string()))
    }

    fn release(&self, inner: &mut ConnectionInner) {
        if let Some(com_object) = inner.com_object.take() {
            self.instance_factory.release_instance(com_object);
        }
        inner.initialized = false;
        inner.com_type = None;
    }
}

/// Serialized, fault-counting access to one automation server instance
pub struct Connection {
    id: ConnectionId,
    settings: ConnectionSettings,
    server: Arc<ServerHandle>,
    inner: Arc<Mutex<ConnectionInner>>,
    errors: ErrorBudget,
    idle: IdleTimer,
    closing: CancellationToken,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        target: ConnectionTarget,
        settings: ConnectionSettings,
        instance_factory: Arc<dyn InstanceFactory>,
        invoker: Arc<dyn MemberInvoker>,
    ) -> Self {
        let errors = ErrorBudget::new(settings.max_errors);
        let server = ServerHandle {
            target,
            component_id: settings.component_id.clone(),
            instance_factory,
            invoker,
        };

        Self {
            id: ConnectionId::next(),
            settings,
            server: Arc::new(server),
            inner: Arc::new(Mutex::new(ConnectionInner::default())),
            errors,
            idle: IdleTimer::new(),
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.server.target
    }

    /// Failures recorded so far, never above `max_errors`
    pub fn error_count(&self) -> u32 {
        self.errors.count()
    }

    /// Whether teardown has started
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Whether teardown has finished and the instance is released
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once teardown has finished
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        let inner = self.inner.lock().await;

        if inner.disposed || self.is_closing() {
            ConnectionState::Disposed
        } else if !self.errors.state().is_request_allowed() {
            ConnectionState::Rejecting
        } else if inner.initialized {
            ConnectionState::Initialized
        } else if inner.com_object.is_some() {
            ConnectionState::Created
        } else if inner.com_type.is_some() {
            ConnectionState::TypeResolved
        } else {
            ConnectionState::Fresh
        }
    }

    /// Create and initialize the external object; a no-op once initialized
    ///
    /// Cancellation and `TooManyErrors` are returned as is. Any other failure
    /// is counted and wrapped in [`Error::Connect`].
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        trace!(address = %self.target().address(), "Trying to connect");

        self.idle.disarm();
        let inner = self.lock(cancel).await?;

        self.connect_locked(inner, cancel).await.map_err(|err| {
            self.fail(err, |address, source| Error::Connect { address, source })
        })
    }

    /// Run a unit of work with no parameters
    pub async fn run(&self, relative_path: &str, cancel: &CancellationToken) -> Result<()> {
        self.run_unit_of_work(relative_path, None, None, None, cancel)
            .await
            .map(drop)
    }

    /// Run a unit of work with input parameters
    pub async fn run_with_context(
        &self,
        relative_path: &str,
        context: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_unit_of_work(relative_path, Some(context), None, None, cancel)
            .await
            .map(drop)
    }

    /// Run a unit of work and read the value stored under `result_key`
    pub async fn run_for_result(
        &self,
        relative_path: &str,
        context: Option<&[(String, String)]>,
        result_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.run_unit_of_work(relative_path, context, Some(result_key), None, cancel)
            .await
    }

    /// Run a unit of work
    ///
    /// Context entries are added to the parameter list in slice order. When
    /// `error_key` is given and the unit of work stored a value under it, the
    /// call fails with [`Error::UnitOfWorkReported`] (wrapped) and no result is
    /// read.
    pub async fn run_unit_of_work(
        &self,
        relative_path: &str,
        context: Option<&[(String, String)]>,
        result_key: Option<&str>,
        error_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        debug!(
            address = %self.target().address(),
            path = relative_path,
            "Running unit of work"
        );

        self.idle.disarm();
        let inner = self.lock(cancel).await?;

        let request = RunRequest {
            relative_path: relative_path.to_string(),
            context: context.map(<[_]>::to_vec).unwrap_or_default(),
            result_key: result_key.map(str::to_string),
            error_key: error_key.map(str::to_string),
        };

        self.run_locked(inner, request, cancel).await.map_err(|err| {
            self.fail(err, |address, source| Error::RunUnitOfWork { address, source })
        })
    }

    /// Arm the idle teardown
    ///
    /// Returns immediately. The connection is torn down once the grace period
    /// passes without another `connect`/`run_*` call; a later `dispose`
    /// pushes the deadline back. Outside a Tokio runtime nothing is scheduled
    /// until `dispose` is called again from within one.
    pub fn dispose(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }

        let grace = self.settings.dispose_grace;
        debug!(
            address = %self.target().address(),
            grace_ms = grace.as_millis() as u64,
            "Dispose requested"
        );

        self.idle.arm(grace);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(
                    address = %self.target().address(),
                    error = %e,
                    "No runtime to schedule teardown"
                );
                return;
            }
        };

        if !self.idle.claim_reaper() {
            return;
        }

        let connection: Weak<Connection> = Arc::downgrade(self);
        let silence = self.idle.subscribe();
        runtime.spawn(async move {
            if !idle::wait_for_silence(silence).await {
                return;
            }
            if let Some(connection) = connection.upgrade() {
                connection.close().await;
            }
        });
    }

    /// Tear down now, skipping the grace period
    ///
    /// Waits for the in-flight call, if any, to finish first.
    pub async fn close(&self) {
        self.closing.cancel();

        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return;
        }

        debug!(address = %self.target().address(), id = %self.id, "Disposing connection");
        self.server.release(&mut inner);
        inner.disposed = true;
        drop(inner);

        self.closed.cancel();
        info!(address = %self.target().address(), id = %self.id, "Connection disposed");
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<InnerGuard> {
        let inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            inner = Arc::clone(&self.inner).lock_owned() => inner,
        };

        if inner.disposed || self.is_closing() {
            return Err(Error::Disposed {
                address: self.target().address().to_string(),
            });
        }

        Ok(inner)
    }

    async fn connect_locked(&self, inner: InnerGuard, cancel: &CancellationToken) -> Result<()> {
        self.errors.check_request()?;

        let (mut inner, com_object) = match inner.com_object.clone() {
            Some(com_object) => (inner, com_object),
            None => {
                let server = Arc::clone(&self.server);
                off_executor(inner, move |inner| server.create_instance(inner)).await?
            }
        };

        ensure_not_cancelled(cancel)?;

        if inner.initialized {
            debug!(address = %self.target().address(), "Already connected");
            return Ok(());
        }

        debug!(address = %self.target().address(), "Initializing connection");
        self.initialize(com_object, cancel).await?;
        inner.initialized = true;

        info!(address = %self.target().address(), id = %self.id, "Connected");
        Ok(())
    }

    /// Race the blocking `Initialize` call against the timeout
    ///
    /// The work runs on its own thread. The timer starts only after that
    /// thread has signalled it is running. If the timer wins, the work is left
    /// to finish in the background and its result is discarded.
    async fn initialize(&self, com_object: ObjectRef, cancel: &CancellationToken) -> Result<()> {
        ensure_not_cancelled(cancel)?;

        let timeout = self
            .target()
            .initialize_timeout()
            .unwrap_or(self.settings.initialize_timeout);

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (result_tx, result_rx) = oneshot::channel::<Result<()>>();

        let server = Arc::clone(&self.server);
        let work_cancel = cancel.clone();

        std::thread::Builder::new()
            .name(format!("initialize-{}", self.id))
            .spawn(move || {
                let _ = started_tx.send(());
                let _ = result_tx.send(server.initialize(&com_object, &work_cancel));
            })
            .map_err(|e| Error::Worker(e.to_string()))?;

        let timer = async {
            if started_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(timeout).await;
        };

        tokio::select! {
            biased;
            result = result_rx => {
                result.unwrap_or_else(|_| Err(Error::Worker("initialization thread panicked".to_string())))
            }
            _ = timer => {
                warn!(
                    address = %self.target().address(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Initialize timeout exceeded"
                );
                Err(Error::InitializeTimeout { timeout })
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn run_locked(
        &self,
        inner: InnerGuard,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        ensure_not_cancelled(cancel)?;
        self.errors.check_request()?;

        let server = Arc::clone(&self.server);
        let cancel = cancel.clone();
        let (_, result) = off_executor(inner, move |inner| {
            server.run_unit_of_work(inner, &request, &cancel)
        })
        .await?;

        Ok(result)
    }

    /// Apply the failure policy shared by `connect` and `run_*`
    fn fail(&self, err: Error, wrap: impl FnOnce(String, Box<Error>) -> Error) -> Error {
        if err.is_passthrough() {
            return err;
        }

        if err.is_counted() {
            let count = self.errors.record_failure();
            warn!(
                address = %self.target().address(),
                error_count = count,
                circuit = self.errors.state().name(),
                error = %err,
                "Connection call failed"
            );
        }

        wrap(self.target().address().to_string(), Box::new(err))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A blocking call still holding the lock keeps the instance alive until it returns
        if let Ok(mut inner) = self.inner.try_lock() {
            if inner.com_object.is_some() {
                debug!(address = %self.server.target.address(), id = %self.id, "Releasing instance on drop");
                self.server.release(&mut inner);
            }
        }
        self.closing.cancel();
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", self.target())
            .field("error_count", &self.errors.count())
            .field("max_errors", &self.errors.max_failures())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Run `work` on the blocking pool while holding the connection lock
///
/// The guard travels with the work, so a cancelled caller never releases the
/// lock under a call that is still in flight.
async fn off_executor<T, F>(mut inner: InnerGuard, work: F) -> Result<(InnerGuard, T)>
where
    T: Send + 'static,
    F: FnOnce(&mut ConnectionInner) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&mut inner).map(|value| (inner, value)))
        .await
        .map_err(|e| Error::Worker(e.to_string()))?
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
