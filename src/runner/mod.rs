//! Command-line surface for standalone broker and core processes.

use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use tandem_broker::{Broker, BrokerConfig};
use tandem_network::{inproc, tcp, NetworkConfig};
use tandem_runtime::Core;

/// Which wire protocol the node speaks to its parent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Shared-process mailboxes; the default for single-process runs.
    #[default]
    Inproc,
    /// Length-prefixed framed TCP.
    Tcp,
}

/// Options accepted by every node process.
#[derive(Debug, Parser)]
#[command(name = "tandem", about = "co-simulation broker/core runner")]
pub struct NodeArgs {
    /// Number of federates the init barrier waits for.
    #[arg(long, default_value_t = 1)]
    pub federates: usize,

    /// Name (inproc) or address (tcp) of the broker to connect to.
    #[arg(long)]
    pub broker: Option<String>,

    /// This node's name.
    #[arg(long)]
    pub name: Option<String>,

    /// Local port to bind.
    #[arg(long)]
    pub port: Option<u16>,

    /// Broker port, overriding any port embedded in `--broker`.
    #[arg(long)]
    pub broker_port: Option<u16>,

    /// Local interface to bind.
    #[arg(long)]
    pub interface: Option<String>,

    /// Log filter, e.g. `info` or `tandem_runtime=debug`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Spawn a broker inside this process if none is reachable.
    #[arg(long, default_value_t = false)]
    pub autobroker: bool,

    /// Transport between this node and its parent.
    #[arg(long, value_enum, default_value_t)]
    pub transport: TransportKind,
}

impl NodeArgs {
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            broker_name: self.broker.clone().unwrap_or_else(|| "broker".to_owned()),
            broker_address: self.broker.clone().unwrap_or_default(),
            broker_port: self.broker_port,
            local_interface: self.interface.clone().unwrap_or_default(),
            local_port: self.port,
        }
    }
}

/// Install the global tracing subscriber from `--log_level` / `RUST_LOG`.
pub fn init_logging(args: &NodeArgs) {
    let filter = args
        .log_level
        .clone()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(tracing_subscriber::EnvFilter::from_default_env);
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run a standalone broker until the federation drains. Returns the process
/// exit code: 0 on clean shutdown, non-zero when an error envelope was
/// observed.
pub fn run_broker(args: &NodeArgs) -> anyhow::Result<i32> {
    let name = args.name.clone().unwrap_or_else(|| "broker".to_owned());
    let config = BrokerConfig::new(&name, args.federates);

    let (broker, _server) = match args.transport {
        TransportKind::Inproc => {
            let mailbox = std::sync::Arc::new(tandem_runtime::Mailbox::new());
            inproc::register(&name, mailbox.clone());
            let broker = Broker::start_with_mailbox(
                config,
                Box::new(inproc::InprocResolver::default()),
                None,
                mailbox,
            );
            (broker, None)
        }
        TransportKind::Tcp => {
            let network = args.network_config();
            let addr: SocketAddr = network.local_socket_addr();
            // Bind first so the resolver sees every accepted connection.
            let mailbox = std::sync::Arc::new(tandem_runtime::Mailbox::new());
            let server = tcp::TcpServer::bind(addr, mailbox.clone())
                .with_context(|| format!("binding broker listener on {addr}"))?;
            tracing::info!("broker listening on {}", server.local_addr());
            let broker = Broker::start_with_mailbox(config, server.resolver(), None, mailbox);
            (broker, Some(server))
        }
    };

    // The listener must outlive the federation.
    broker.join();
    Ok(if broker.observed_error() { 1 } else { 0 })
}

/// Start a core per the CLI options, spawning a local broker first when
/// `--autobroker` is set.
pub fn start_core(args: &NodeArgs) -> anyhow::Result<std::sync::Arc<Core>> {
    let name = args.name.clone().unwrap_or_else(|| "core".to_owned());
    match args.transport {
        TransportKind::Inproc => {
            let broker_name = args.broker.clone().unwrap_or_else(|| "broker".to_owned());
            if args.autobroker && inproc::connect(&broker_name).is_err() {
                let broker_mailbox = std::sync::Arc::new(tandem_runtime::Mailbox::new());
                inproc::register(&broker_name, broker_mailbox.clone());
                Broker::start_with_mailbox(
                    BrokerConfig::new(&broker_name, args.federates),
                    Box::new(inproc::InprocResolver::default()),
                    None,
                    broker_mailbox,
                );
            }
            let uplink = inproc::connect(&broker_name)
                .with_context(|| format!("no broker named {broker_name:?}"))?;
            let mailbox = std::sync::Arc::new(tandem_runtime::Mailbox::new());
            inproc::register(&name, mailbox.clone());
            Ok(Core::start_with_mailbox(&name, uplink, mailbox))
        }
        TransportKind::Tcp => {
            let network = args.network_config();
            let addr = network
                .broker_socket_addr()
                .context("a tcp core needs --broker host:port")?;
            let mailbox = std::sync::Arc::new(tandem_runtime::Mailbox::new());
            let connection = tcp::TcpConnection::connect(addr, mailbox.clone())
                .with_context(|| format!("connecting to broker at {addr}"))?;
            let core = Core::start_with_mailbox(&name, connection.route(), mailbox);
            // The connection lives as long as the process.
            Box::leak(Box::new(connection));
            Ok(core)
        }
    }
}
