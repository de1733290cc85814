//! Tandem is a co-simulation runtime: independently written simulators
//! (*federates*) run in parallel on a shared virtual clock, exchanging typed
//! values and discrete messages through a hierarchy of cores and brokers.
//! The time coordinator guarantees that no federate is ever granted a time
//! at which it could still receive data with an earlier timestamp.
//!
//! ## Example
//!
//! A two-federate value exchange over the in-process transport:
//!
//! ```no_run
//! use tandem::federation;
//! use tandem::core::{IterationRequest, Time};
//! use tandem::runtime::Federate;
//!
//! let (broker, cores) = federation::start_inproc("demo_broker", 2, &["demo_core"]);
//! let core = &cores[0];
//!
//! std::thread::scope(|scope| {
//!     scope.spawn(|| {
//!         let mut source = Federate::new(core, "source").unwrap();
//!         let pub_handle = source.register_publication("values", "double", "").unwrap();
//!         source.enter_initializing_mode().unwrap();
//!         source.enter_executing_mode().unwrap();
//!         for step in 1..=10i64 {
//!             source.publish(pub_handle, format!("{step}").as_bytes()).unwrap();
//!             source
//!                 .request_time(Time::from_seconds(step as f64), IterationRequest::NoIterations)
//!                 .unwrap();
//!         }
//!         source.finalize().unwrap();
//!     });
//!     scope.spawn(|| {
//!         let mut sink = Federate::new(core, "sink").unwrap();
//!         let input = sink.register_input("values", "double", "", true).unwrap();
//!         sink.enter_initializing_mode().unwrap();
//!         sink.enter_executing_mode().unwrap();
//!         for step in 1..=10i64 {
//!             sink.request_time(Time::from_seconds(step as f64), IterationRequest::NoIterations)
//!                 .unwrap();
//!             if sink.is_updated(input) {
//!                 println!("t={step}: {:?}", sink.get_value(input));
//!             }
//!         }
//!         sink.finalize().unwrap();
//!     });
//! });
//! broker.join();
//! ```

#[cfg(feature = "runner")]
pub mod runner;

pub mod federation;

// Re-exports
pub use tandem_broker as broker;
pub use tandem_core as core;
pub use tandem_network as network;
pub use tandem_runtime as runtime;
