//! Convenience launchers for assembling a federation in one process.

use std::sync::Arc;

use tandem_broker::{Broker, BrokerConfig};
use tandem_network::inproc;
use tandem_runtime::{Core, Mailbox};

/// Start a root broker and the named cores on the in-process transport.
///
/// The broker's init barrier waits for `federates` registrations. Each core
/// name must be unique within the process.
pub fn start_inproc(
    broker_name: &str,
    federates: usize,
    core_names: &[&str],
) -> (Arc<Broker>, Vec<Arc<Core>>) {
    let broker_mailbox = Arc::new(Mailbox::new());
    inproc::register(broker_name, broker_mailbox.clone());
    let broker = Broker::start_with_mailbox(
        BrokerConfig::new(broker_name, federates),
        Box::new(inproc::InprocResolver::default()),
        None,
        broker_mailbox,
    );

    let cores = core_names
        .iter()
        .map(|name| {
            let uplink = inproc::connect(broker_name).expect("broker just registered");
            // The mailbox must be resolvable before the core announces
            // itself to the broker.
            let mailbox = Arc::new(Mailbox::new());
            inproc::register(name, mailbox.clone());
            Core::start_with_mailbox(name, uplink, mailbox)
        })
        .collect();
    (broker, cores)
}

/// Tear down the in-process registry entries created by [`start_inproc`].
pub fn shutdown_inproc(broker_name: &str, core_names: &[&str]) {
    for name in core_names {
        inproc::unregister(name);
    }
    inproc::unregister(broker_name);
}
