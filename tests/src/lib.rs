//! # Event Broker Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/          # criterion: matcher, memory fan-out
//! └── src/integration/
//!     ├── conformance.rs  # one contract suite, run against every in-process broker
//!     ├── mqtt_wire.rs    # ref-counted wire subscriptions through the mock transport
//!     ├── concurrency.rs  # racing subscribe/unsubscribe/publish/close
//!     └── live.rs         # real servers, #[ignore]d
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p broker-tests
//!
//! # Live servers (one per backend)
//! BROKER_TEST_NATS_URL=nats://127.0.0.1:4222 \
//!     cargo test -p broker-tests --features live -- --ignored
//!
//! cargo bench -p broker-tests
//! ```

pub mod integration;
