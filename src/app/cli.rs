//! Command-line surface of the trigger builder daemon.

use crate::app::collection::{HttpCollectionTransport, TebApp};
use crate::app::decide::DecideRegistry;
use crate::config::db::HttpConfigDb;
use crate::config::params::EbParams;
use crate::observability::stats::{HttpStatsSink, StatsMonitor};
use crate::runtime::affinity::pin_thread;
use crate::runtime::signals::install_sigint;
use crate::transport::fabric::Fabric;
use thiserror::Error;

/// Default run-time monitoring port.
pub const RTMON_PORT_BASE: u16 = 5559;
/// Default monitoring period in seconds.
pub const RTMON_PERIOD_S: u64 = 1;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Missing '{0}' parameter")]
    MissingRequired(&'static str),
    #[error("Flag '{0}' requires a value")]
    MissingValue(&'static str),
    #[error("Bad value '{value}' for flag '{flag}'")]
    BadValue { flag: &'static str, value: String },
    #[error("{0}")]
    Help(String),
}

/// Parsed command-line options.
#[derive(Debug, Clone)]
pub struct CliOptions {
    pub coll_srv: String,
    pub rtmon_host: String,
    pub rtmon_port: u16,
    pub rtmon_period_s: u64,
    pub prms: EbParams,
}

pub fn usage(name: &str) -> String {
    format!(
        "Usage:\n  {name} [OPTIONS]\n\nTrigger Event Builder application\n\nOptions:\n  \
         -C <address>        Collection server (required)\n  \
         -p <partition>      Partition number (required)\n  \
         -A <interface_addr> IP address of the interface to use\n  \
         -Z <address>        Run-time monitoring server host (required)\n  \
         -R <port>           Run-time monitoring server port (default: {RTMON_PORT_BASE})\n  \
         -m <seconds>        Run-time monitoring period (default: {RTMON_PERIOD_S})\n  \
         -1 <core>           Core number for pinning the App thread\n  \
         -2 <core>           Core number for pinning other threads\n  \
         -u <alias>          Alias for the teb process (required)\n  \
         -v                  Enable debugging output (repeat for more detail)\n  \
         -h                  Display this help output"
    )
}

/// Parses the argument vector. Required flags missing or malformed values
/// surface as errors the caller turns into exit code 1.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliOptions, CliError> {
    let mut args = args.into_iter();
    let name = args.next().unwrap_or_else(|| "teb".to_string());

    let mut coll_srv = None;
    let mut rtmon_host = None;
    let mut rtmon_port = RTMON_PORT_BASE;
    let mut rtmon_period_s = RTMON_PERIOD_S;
    let mut prms = EbParams::default();

    fn value(
        args: &mut impl Iterator<Item = String>,
        flag: &'static str,
    ) -> Result<String, CliError> {
        args.next().ok_or(CliError::MissingValue(flag))
    }

    fn number<T: std::str::FromStr>(flag: &'static str, raw: String) -> Result<T, CliError> {
        raw.parse()
            .map_err(|_| CliError::BadValue { flag, value: raw })
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-C" => coll_srv = Some(value(&mut args, "-C")?),
            "-p" => prms.partition = number("-p", value(&mut args, "-p")?)?,
            "-A" => prms.if_addr = value(&mut args, "-A")?,
            "-Z" => rtmon_host = Some(value(&mut args, "-Z")?),
            "-R" => rtmon_port = number("-R", value(&mut args, "-R")?)?,
            "-m" => rtmon_period_s = number("-m", value(&mut args, "-m")?)?,
            "-1" => prms.core[0] = number("-1", value(&mut args, "-1")?)?,
            "-2" => prms.core[1] = number("-2", value(&mut args, "-2")?)?,
            "-u" => prms.alias = value(&mut args, "-u")?,
            "-v" => prms.verbose += 1,
            "-h" | "-?" => return Err(CliError::Help(usage(&name))),
            _ => return Err(CliError::Help(usage(&name))),
        }
    }

    if prms.partition == u32::MAX {
        return Err(CliError::MissingRequired("-p <partition number>"));
    }
    let coll_srv = coll_srv.ok_or(CliError::MissingRequired("-C <collection server>"))?;
    let rtmon_host = rtmon_host.ok_or(CliError::MissingRequired("-Z <run-time monitoring host>"))?;
    if prms.alias.is_empty() {
        return Err(CliError::MissingRequired("-u <alias>"));
    }

    Ok(CliOptions {
        coll_srv,
        rtmon_host,
        rtmon_port,
        rtmon_period_s,
        prms,
    })
}

/// Daemon entry point: wire the fabric, metrics, registry, and
/// coordinator client, then dispatch until the bus closes.
pub fn run() -> anyhow::Result<()> {
    let opts = match parse_args(std::env::args()) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    pin_thread(opts.prms.core[1]);

    let fabric = Fabric::new();
    let sink = HttpStatsSink::new(&opts.rtmon_host, opts.rtmon_port)?;
    let smon = StatsMonitor::new(opts.rtmon_period_s, Box::new(sink));
    smon.startup();

    let registry = DecideRegistry::with_builtins();
    let configdb = HttpConfigDb::new(format!("http://{}/configdb", opts.coll_srv))?;
    let transport = HttpCollectionTransport::new(
        format!("http://{}", opts.coll_srv),
        "teb",
        std::process::id() as u64,
    )?;

    let mut app = TebApp::new(
        Box::new(transport),
        fabric,
        smon.clone(),
        registry,
        Box::new(configdb),
        opts.prms,
    )?;
    install_sigint(&app.running());

    app.run()?;

    smon.shutdown();
    Ok(())
}
