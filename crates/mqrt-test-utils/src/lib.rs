// mqrt-test-utils: Shared test utilities for the mqrt runtime.
//
// Provides an in-memory mock broker and client implementing the runtime's
// MQTT client contract, with enough QoS-1 machinery (puback probes, forced
// redelivery, offline queueing, session loss) to test ack policies and dedup
// replay without a real broker.

pub mod mock_broker;

pub use mock_broker::{AckState, MockBroker, MockClient};

/// Install a test tracing subscriber honouring `RUST_LOG`.  Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
