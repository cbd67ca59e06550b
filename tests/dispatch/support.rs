//! Harness: a registry served over an in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use remote_fn::bus::InMemoryBus;
use remote_fn::{Client, Listener, ListenerHandle, Registry, Settings};

use crate::functions;

pub struct Harness {
    pub bus: InMemoryBus,
    pub client: Client,
    pub handle: ListenerHandle,
}

/// Settings with short waits so tests stay fast.
pub fn settings() -> Settings {
    Settings::default()
        .with_fetch_wait(Duration::from_millis(20))
        .with_drain_timeout(Duration::from_secs(1))
}

/// Registry with the shared functions under the `math` namespace.
pub fn registry() -> Registry {
    let mut registry = Registry::with_namespace("math");
    registry.register(functions::add).unwrap();
    registry.register(functions::greeting).unwrap();
    registry.register(functions::fail).unwrap();
    registry.register(functions::slow).unwrap();
    registry.register(functions::sign_up).unwrap();
    registry.register(functions::withdraw).unwrap();
    registry
}

pub async fn serve(registry: Registry) -> Harness {
    serve_on(InMemoryBus::new(), registry, settings()).await
}

/// Route listener logs to the test writer; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn serve_on(bus: InMemoryBus, registry: Registry, settings: Settings) -> Harness {
    init_tracing();
    let listener = Listener::new(Arc::new(registry), Arc::new(bus.clone()), settings.clone());
    let handle = listener.start().await.unwrap();
    let client = Client::new(Arc::new(bus.clone()), settings);
    Harness {
        bus,
        client,
        handle,
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
