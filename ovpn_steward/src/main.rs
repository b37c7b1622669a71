use ctrlc::Error as CtrlcError;

use std::path::Path;
use std::process;
use std::sync::Arc;

use ovpn_steward_lib::audit::AuditLog;
use ovpn_steward_lib::event::{Bus, Event};
use ovpn_steward_lib::firewall::Firewall;
use ovpn_steward_lib::orgs::DirOrgStore;
use ovpn_steward_lib::server::{Notify, Steward};
use ovpn_steward_lib::settings::{self, Settings};

mod cli;

fn ctrlc_channel() -> Result<crossbeam_channel::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = crossbeam_channel::bounded(2);
    match ctrlc::set_handler(move || match sender.send(()) {
        Ok(_) => (),
        Err(e) => {
            tracing::error!(error = ?e, "sending interrupt signal");
        }
    }) {
        Ok(_) => Ok(receiver),
        Err(CtrlcError::NoSuchSignal(signal_type)) => {
            tracing::error!(?signal_type, "no such signal");
            Err(exitcode::OSERR)
        }
        Err(CtrlcError::MultipleHandlers) => {
            tracing::error!("multiple handlers");
            Err(exitcode::UNAVAILABLE)
        }
        Err(CtrlcError::System(e)) => {
            tracing::error!(error = ?e, "system error");
            Err(exitcode::IOERR)
        }
    }
}

fn read_settings(config_path: &Path) -> Result<Settings, exitcode::ExitCode> {
    match settings::read(config_path) {
        Ok(settings) => Ok(settings),
        Err(settings::Error::NoFile) => {
            tracing::warn!(config_file = %config_path.display(), "configuration file not found, using defaults");
            Ok(Settings::default())
        }
        Err(e) => {
            tracing::error!(error = %e, config_file = %config_path.display(), "cannot read configuration file");
            Err(exitcode::CONFIG)
        }
    }
}

fn daemon(args: &cli::Cli) -> exitcode::ExitCode {
    let ctrlc_receiver = match ctrlc_channel() {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    let settings = match read_settings(&args.config_path) {
        Ok(settings) => settings,
        Err(exit) => return exit,
    };

    let firewall = match Firewall::system() {
        Ok(firewall) => Arc::new(firewall),
        Err(e) => {
            tracing::error!(error = %e, "cannot initialize firewall access");
            return exitcode::OSERR;
        }
    };

    let audit = match AuditLog::open(&settings.data_path) {
        Ok(audit) => audit,
        Err(e) => {
            tracing::error!(error = %e, "cannot open audit log");
            return exitcode::IOERR;
        }
    };

    let orgs = Arc::new(DirOrgStore::new(&settings.data_path));
    let (bus, bus_receiver) = Bus::channel();
    let steward = Steward::new(settings, orgs, firewall, bus, audit);

    if !args.no_start {
        for mut server in steward.servers() {
            let name = server.record().name.clone();
            match server.start(Notify::Announce) {
                Ok(_) => tracing::info!(server = %name, "server started"),
                Err(e) => tracing::error!(server = %name, error = %e, "failed starting server"),
            }
        }
    }

    tracing::info!("supervising servers");
    loop {
        crossbeam_channel::select! {
            recv(ctrlc_receiver) -> _ => {
                tracing::info!("initiate shutdown");
                break;
            }
            recv(bus_receiver) -> event => {
                match event {
                    Ok(event) => log_event(event),
                    Err(e) => {
                        tracing::error!(error = ?e, "event bus closed");
                        break;
                    }
                }
            }
        }
    }

    let mut exit = exitcode::OK;
    for mut server in steward.servers() {
        if !server.status() {
            continue;
        }
        let name = server.record().name.clone();
        if let Err(e) = server.stop(Notify::Silent) {
            tracing::warn!(server = %name, error = %e, "graceful stop failed, forcing");
            if let Err(e) = server.force_stop(Notify::Silent) {
                tracing::error!(server = %name, error = %e, "failed stopping server");
                exit = exitcode::TEMPFAIL;
            }
        }
    }
    exit
}

fn log_event(event: Event) {
    tracing::debug!(%event, "bus event");
}

fn main() {
    let args = cli::parse();

    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = daemon(&args);

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}
