//! jobd - per-host job supervisor daemon
//!
//! Binds the control socket for the invoking uid, loads nothing on its
//! own, and waits for clients to submit jobs. A trailing command becomes
//! the firstborn job: it is started immediately and its clean exit shuts
//! the supervisor down.
//!
//! Without jobs loaded (and outside system mode) the daemon exits after
//! an idle timeout, so it can be started on demand by its clients.

use std::io;

use clap::Parser;
use log::info;

use jobd::ipc::ControlServer;
use jobd::protocol::SOCKET_PREFIX;
use jobd::supervisor::{DaemonSignal, Event, Supervisor, SupervisorConfig};

#[derive(Parser)]
#[command(name = "jobd")]
#[command(about = "Per-host job supervisor daemon")]
#[command(
    long_about = "jobd supervises jobs submitted over its control socket: it owns \
    their listening sockets, watch paths and timers, launches children on demand, \
    and throttles the ones that fail too fast."
)]
struct Args {
    /// Run as the host's system supervisor (no idle exit, kernel knobs
    /// follow rlimit changes)
    #[arg(long)]
    system: bool,

    /// Use a socket directory private to this process (uid.pid)
    #[arg(long)]
    session: bool,

    /// Directory under which the control-socket directory is created
    #[arg(long, default_value = SOCKET_PREFIX)]
    socket_prefix: String,

    /// Command to run as the firstborn job; its clean exit stops jobd
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let system = args.system || std::process::id() == 1;
    // A firstborn gets a session of its own, so a second invocation with
    // a different command does not fight over the per-uid socket.
    let create_session = args.session || !args.command.is_empty();

    let cfg = SupervisorConfig {
        socket_prefix: args.socket_prefix.clone(),
        create_session,
        system,
    };
    let mut supervisor = Supervisor::new(cfg);

    let server = match ControlServer::bind(&args.socket_prefix, create_session) {
        Ok(server) => server,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            info!("another supervisor is already serving this uid");
            return Ok(());
        }
        Err(e) => {
            log::error!("cannot bind control socket: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = spawn_signal_forwarder(supervisor.event_sender()) {
        log::error!("cannot install signal handlers: {}", e);
        return Err(e);
    }

    if !args.command.is_empty() {
        supervisor.submit_firstborn(args.command.clone());
    }

    tokio::spawn(server.serve(supervisor.ipc_sender()));

    supervisor.run().await
}

/// Funnel the caught signals into the supervisor's event queue; nothing
/// is handled in signal context.
fn spawn_signal_forwarder(
    tx: tokio::sync::mpsc::UnboundedSender<Event>,
) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                _ = term.recv() => DaemonSignal::Terminate,
                _ = int.recv() => DaemonSignal::Interrupt,
                _ = hup.recv() => DaemonSignal::Hangup,
            };
            if tx.send(Event::Signal(sig)).is_err() {
                break;
            }
        }
    });

    Ok(())
}
