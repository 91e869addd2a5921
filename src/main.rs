//! wsd - multi-process WebSocket server.
//!
//! Without `--worker-slot` the binary is the master: it binds the listening
//! socket, then supervises `--workers` copies of itself. With it, the binary
//! is a worker serving the inherited socket.
//!
//! The bundled application relays every message to all other clients.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGUSR1};
use signal_hook::flag;
use signal_hook::iterator::Signals;

use wsd::server::{Handler, Router, Server};
use wsd::supervisor::{
    self, ChildProcesses, EXIT_CONNECT_ERROR, EXIT_FORK_FAILED, EXIT_MANUAL_KILL, HANDLED_SIGNALS,
    Supervisor,
};
use wsd::transport::bind_listener;
use wsd::{
    Config, Connection, ConnectionId, DriverKind, Error, Limits, Message, Result, ServerConfig,
    SupervisorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "wsd")]
#[command(version)]
#[command(about = "Multi-process RFC 6455 WebSocket server")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Transport driver: sockets, streams or event-loop (probed when omitted)
    #[arg(long)]
    driver: Option<DriverKind>,

    /// Number of worker processes; 0 serves from the master process itself
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Largest accepted frame payload, in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    #[arg(long, hide = true)]
    worker_slot: Option<usize>,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut limits = Limits::default();
        if let Some(max) = self.max_frame_size {
            limits.max_frame_size = max;
            limits.max_message_size = limits.max_message_size.max(max);
        }
        let mut config = ServerConfig::new(self.host.clone(), self.port)
            .with_workers(self.workers)
            .with_protocol(Config::server().with_limits(limits));
        if let Some(driver) = self.driver {
            config = config.with_driver(driver);
        }
        config
    }

    /// Arguments handed to every worker.
    fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if let Some(driver) = self.driver {
            args.extend(["--driver".to_string(), driver.to_string()]);
        }
        if let Some(max) = self.max_frame_size {
            args.extend(["--max-frame-size".to_string(), max.to_string()]);
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }
}

/// Relays each message to every other open connection.
#[derive(Default)]
struct Relay {
    relayed: u64,
}

impl Handler for Relay {
    fn on_open(&mut self, id: ConnectionId, router: &mut Router<'_>) {
        let path = router.connection(id).map(|c| c.path.clone()).unwrap_or_default();
        log::info!("client {} joined on {}", id, path);
    }

    fn on_message(&mut self, id: ConnectionId, message: Message, router: &mut Router<'_>) {
        let result = router.broadcast(&message, &[], &[id], id);
        self.relayed += result.delivered.len() as u64;
        for (peer, code) in result.failed {
            log::debug!("relay from {} to {} failed with {}", id, peer, code);
        }
    }

    fn on_close(&mut self, id: ConnectionId, connection: &Connection, _router: &mut Router<'_>) {
        log::info!(
            "client {} left after {} message(s)",
            id,
            connection.messages_received
        );
    }

    fn on_error(&mut self, id: ConnectionId, error: &Error) {
        log::debug!("client {}: {}", id, error);
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn register_stop_flags(stop: &Arc<AtomicBool>) -> Result<()> {
    for signal in [SIGINT, SIGTERM] {
        flag::register(signal, Arc::clone(stop)).map_err(|err| Error::Signal(err.to_string()))?;
    }
    Ok(())
}

fn run_worker(cli: &Cli, slot: usize) -> ExitCode {
    let Some(listener) = supervisor::inherited_listener() else {
        log::error!("worker {}: no listening socket inherited", slot);
        return exit_code(EXIT_CONNECT_ERROR);
    };

    let stop = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    let registered = register_stop_flags(&stop).and_then(|()| {
        flag::register(SIGUSR1, Arc::clone(&reload))
            .map(drop)
            .map_err(|err| Error::Signal(err.to_string()))
    });
    if let Err(err) = registered {
        log::error!("worker {}: {}", slot, err);
        return exit_code(EXIT_FORK_FAILED);
    }

    let mut server = match Server::from_listener(listener, Relay::default(), cli.server_config()) {
        Ok(server) => server,
        Err(err) => {
            log::error!("worker {}: {}", slot, err);
            return exit_code(EXIT_CONNECT_ERROR);
        }
    };
    log::info!("worker {} serving (pid {})", slot, std::process::id());

    let result = server.run_with(&stop, |server| {
        if reload.swap(false, Ordering::SeqCst) {
            let old = server.replace_handler(Relay::default());
            log::info!("worker {}: handler reloaded ({} relayed)", slot, old.relayed);
        }
    });
    match result {
        Ok(()) => exit_code(EXIT_MANUAL_KILL),
        Err(err) => {
            log::error!("worker {}: {}", slot, err);
            ExitCode::FAILURE
        }
    }
}

fn daemonize() -> Result<()> {
    // SAFETY: called before any thread is started.
    if unsafe { libc::daemon(1, 0) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn run_master(cli: &Cli) -> Result<()> {
    let config = cli.server_config();
    if let Some(driver) = config.driver {
        if !driver.is_supported() {
            return Err(Error::DriverUnsupported(driver.to_string()));
        }
    }

    let listener = bind_listener(&config.host, config.port, config.backlog)?;
    log::info!("listening on {}", listener.local_addr()?);

    if cli.daemon {
        daemonize()?;
    }

    if cli.workers == 0 {
        let stop = Arc::new(AtomicBool::new(false));
        register_stop_flags(&stop)?;
        let mut server = Server::from_listener(listener, Relay::default(), config)?;
        return server.run(&stop);
    }

    let mut signals =
        Signals::new(HANDLED_SIGNALS).map_err(|err| Error::Signal(err.to_string()))?;
    let control = ChildProcesses::new(listener, cli.worker_args())?;
    let mut supervisor = Supervisor::new(control, SupervisorConfig::new(cli.workers));
    supervisor.run(&mut signals)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    if let Some(slot) = cli.worker_slot {
        return run_worker(&cli, slot);
    }

    match run_master(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
