//! Gateway lifecycle: `Created -> Running -> Stopped`.
//!
//! Startup order:
//! 1. subscribe to bus events and restrict the driver to the configured devices
//! 2. wait for the driver's initial catalog (bounded by [`DRIVER_INIT_TIMEOUT`])
//! 3. configure the runtime and, in static mode, provision every configured node
//! 4. start the event pump and the serving thread
//!
//! Shutdown clears the run flag, waits for the serving thread with a bounded
//! grace period and aborts the event pump. The engine outlives the serving
//! thread because the gateway owns both and stops serving first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::Span;

use opcua_gateway_core::address_space::{AddressSpace, ServerError, ServerRuntime, StatusCode};
use opcua_gateway_core::bus::DeviceDriver;
use opcua_gateway_core::config::{GatewayConfig, SyncMode};

use crate::engine::SyncEngine;
use crate::error::{GatewayError, Result};

/// Upper bound for the driver's initial synchronization.
pub const DRIVER_INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default grace period for the serving thread to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const SERVER_THREAD_NAME: &str = "opcua-server";

/// Called with the status of a serving loop that failed after startup.
pub type FatalHook = Arc<dyn Fn(StatusCode) + Send + Sync>;

fn exit_on_fatal() -> FatalHook {
    Arc::new(|status| {
        tracing::error!(%status, "OPC UA serving loop failed, exiting");
        std::process::exit(1);
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Created,
    Running,
    Stopped,
}

struct ServerThread {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<StatusCode>,
}

/// Owns the engine, the runtime and the serving thread.
pub struct Gateway<R: ServerRuntime + 'static> {
    config: GatewayConfig,
    driver: Arc<dyn DeviceDriver>,
    runtime: Arc<R>,
    engine: Arc<SyncEngine>,
    state: Mutex<GatewayState>,
    running: Arc<AtomicBool>,
    server_thread: Mutex<Option<ServerThread>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    fatal_hook: FatalHook,
    init_timeout: Duration,
    span: Span,
}

impl<R: ServerRuntime + 'static> Gateway<R> {
    pub fn new(config: GatewayConfig, driver: Arc<dyn DeviceDriver>, runtime: Arc<R>) -> Self {
        let span = tracing::info_span!("gateway");
        let address_space: Arc<dyn AddressSpace> = runtime.clone();
        let engine = SyncEngine::with_span(
            config.clone(),
            driver.clone(),
            address_space,
            tracing::info_span!(parent: &span, "sync_engine"),
        );

        Self {
            config,
            driver,
            runtime,
            engine,
            state: Mutex::new(GatewayState::Created),
            running: Arc::new(AtomicBool::new(false)),
            server_thread: Mutex::new(None),
            pump: Mutex::new(None),
            fatal_hook: exit_on_fatal(),
            init_timeout: DRIVER_INIT_TIMEOUT,
            span,
        }
    }

    /// Replace the handler for a failed serving loop.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> GatewayState {
        *self.state.lock()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Bring the gateway to `Running`. Must be called inside a tokio runtime.
    ///
    /// Blocks while the driver synchronizes. Any error leaves the gateway in
    /// `Created` with nothing running.
    pub fn start(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        match *state {
            GatewayState::Created => {}
            GatewayState::Running => return Err(ServerError::AlreadyRunning.into()),
            GatewayState::Stopped => {
                return Err(GatewayError::InvalidState(
                    "gateway was stopped and cannot be restarted".to_string(),
                ));
            }
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::NoRuntime(e.to_string()))?;

        let events = self.driver.subscribe();
        let filter = self.config.device_filter();
        tracing::debug!(?filter, "Applying device filter");
        self.driver.set_filter(filter)?;
        self.driver.wait_for_ready(self.init_timeout)?;

        self.runtime.configure(&self.config.server)?;
        match self.config.mode {
            SyncMode::Static => {
                self.engine.provision_static()?;
            }
            SyncMode::Reactive => {
                let created = self.engine.sync_existing();
                tracing::info!(nodes = created, "Reactive mode, initial nodes created");
            }
        }

        *self.pump.lock() = Some(self.engine.spawn_event_pump(events));

        self.running.store(true, Ordering::SeqCst);
        match self.spawn_server_thread() {
            Ok(thread) => *self.server_thread.lock() = Some(thread),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if let Some(pump) = self.pump.lock().take() {
                    pump.abort();
                }
                return Err(e);
            }
        }

        *state = GatewayState::Running;
        tracing::info!(endpoint = %self.config.server.endpoint_url(), "Gateway started");
        Ok(())
    }

    fn spawn_server_thread(&self) -> Result<ServerThread> {
        let runtime = self.runtime.clone();
        let running = self.running.clone();
        let fatal_hook = self.fatal_hook.clone();
        let span = self.span.clone();
        let (done_tx, done) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(SERVER_THREAD_NAME.to_string())
            .spawn(move || {
                let _enter = span.enter();
                let status = runtime.run(&running);
                // The receiver may be gone if stop() already timed out.
                let _ = done_tx.send(status);
                if status.is_bad() {
                    fatal_hook(status);
                } else {
                    tracing::debug!("Serving loop exited");
                }
            })
            .map_err(|e| ServerError::Thread(e.to_string()))?;

        Ok(ServerThread { handle, done })
    }

    /// Stop serving and release the event pump. A second call is a no-op.
    ///
    /// Returns `ShutdownTimeout` if the serving thread is still running after
    /// `grace`; the thread is detached in that case.
    pub fn stop(&self, grace: Duration) -> Result<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        if *state != GatewayState::Running {
            *state = GatewayState::Stopped;
            return Ok(());
        }
        *state = GatewayState::Stopped;

        self.running.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let Some(thread) = self.server_thread.lock().take() else {
            return Ok(());
        };
        match thread.done.recv_timeout(grace) {
            Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if thread.handle.join().is_err() {
                    tracing::error!("Serving thread panicked");
                }
                tracing::info!("Gateway stopped");
                Ok(())
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::error!(
                    grace_ms = grace.as_millis() as u64,
                    "Serving thread did not stop"
                );
                Err(ServerError::ShutdownTimeout(grace.as_millis() as u64).into())
            }
        }
    }
}

impl<R: ServerRuntime + 'static> Drop for Gateway<R> {
    fn drop(&mut self) {
        if let Err(e) = self.stop(DEFAULT_STOP_TIMEOUT) {
            tracing::error!(error = %e, "Gateway shutdown failed");
        }
    }
}
