use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::*;
use smallbattmod_lib::balancer::{BalanceConfig, Balancer};
use smallbattmod_lib::protocol::Address;
use smallbattmod_lib::serialport::SmallBattMod;
use std::{
    ops::Deref,
    panic,
    path::{Path, PathBuf},
    time::Duration,
};

mod commandline;
use commandline::{CliArgs, CliCommands};

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
}

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");
    set_panic_hook();
    log_handle
}

/// Balancing runs log to a file keyed by the battery serial number and the
/// UTC date, duplicated to the console.
fn logging_init_with_file(loglevel: LevelFilter, dir: &Path, sn: u32) -> Result<LoggerHandle> {
    let date = chrono::Utc::now().format("%Y-%m-%d");
    let file_spec = FileSpec::default()
        .directory(dir)
        .basename("bluefin1.5kwh")
        .discriminant(format!("{sn}_{date}"))
        .suffix("log")
        .use_timestamp(false);
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .log_to_file(file_spec)
        .duplicate_to_stderr(Duplicate::All)
        .format(flexi_logger::detailed_format)
        .start()
        .with_context(|| "Cannot start logging")?;
    set_panic_hook();
    Ok(log_handle)
}

/// Probes every enumerated serial port with a version query and returns the
/// first one on which a battery identifies itself.
fn discover_port(address: u8, timeout: Duration) -> Result<String> {
    let ports = serialport::available_ports().with_context(|| "Cannot enumerate serial ports")?;
    for info in ports {
        let name = info.port_name;
        debug!("Probing serial port '{name}'");
        let Ok(mut bms) = SmallBattMod::new(&name, address) else {
            continue;
        };
        if bms.set_timeout(timeout).is_ok() && bms.get_version_summary().is_ok() {
            info!("Found SmallBattMod on '{name}'");
            return Ok(name);
        }
    }
    bail!("No SmallBattMod battery found on any serial port")
}

fn connect(args: &CliArgs) -> Result<SmallBattMod> {
    let port = match &args.device {
        Some(device) => device.clone(),
        None => discover_port(args.address, args.timeout)?,
    };
    let mut bms = SmallBattMod::new(&port, args.address)
        .with_context(|| format!("Cannot open serial port '{port}'"))?;
    bms.set_timeout(args.timeout)?;
    Ok(bms)
}

fn run_balance(args: &CliArgs, threshold: f32, cadence: Duration, log_dir: PathBuf) -> Result<()> {
    let mut bms = connect(args)?;
    let versum = bms
        .get_version_summary()
        .with_context(|| "Cannot query version summary")?;

    let _log_handle = logging_init_with_file(args.verbose.log_level_filter(), &log_dir, versum.sn)?;
    debug!("{0:-<35} New Run {0:-<35}", "");
    info!("Connected to battery {}.", versum.sn);
    info!("Battery FW version: {}.", versum.firmware_info);

    bms.reset(Duration::from_secs(1))
        .with_context(|| "Cannot reset battery")?;
    let address = bms
        .get_address()
        .with_context(|| "Cannot query battery address")?;
    info!("Current battery address: {}", address.value());

    let config = BalanceConfig {
        threshold,
        cadence,
        ..BalanceConfig::default()
    };
    let mut balancer = Balancer::new(bms, config);
    if let Err(e) = balancer.run() {
        error!("Balancing run aborted: {e}");
        return Err(e.into());
    }
    info!("Exiting application.");
    Ok(())
}

fn run_command(args: &CliArgs, command: CliCommands) -> Result<()> {
    let mut bms = connect(args)?;
    match command {
        CliCommands::Summary => println!(
            "Summary: {:?}",
            bms.get_summary().with_context(|| "Cannot get summary")?
        ),
        CliCommands::Version => println!(
            "Version: {:?}",
            bms.get_version_summary()
                .with_context(|| "Cannot get version summary")?
        ),
        CliCommands::CellVoltages => println!(
            "Cell voltages: {:?}",
            bms.get_cell_voltages()
                .with_context(|| "Cannot get cell voltages")?
        ),
        CliCommands::Address => println!(
            "Address: {}",
            bms.get_address()
                .with_context(|| "Cannot get address")?
                .value()
        ),
        CliCommands::SetAddress { address } => {
            let address = Address::new(address)?;
            bms.set_address(address)
                .with_context(|| "Cannot set address")?;
            println!("Address set to {}", address.value());
        }
        CliCommands::Sleep { seconds } => bms
            .sleep(seconds)
            .with_context(|| "Cannot put battery to sleep")?,
        CliCommands::Off => bms.off().with_context(|| "Cannot turn battery off")?,
        CliCommands::Reset => bms
            .reset(Duration::from_secs(1))
            .with_context(|| "Cannot reset battery")?,
        CliCommands::BalanceCell { cell } => {
            if bms
                .balance_cell(cell)
                .with_context(|| "Cannot discharge cell")?
            {
                println!("Cell {cell} discharging");
            } else {
                println!("Discharge command for cell {cell} refused");
            }
        }
        CliCommands::BalanceBest => {
            if bms
                .balance_best_cell()
                .with_context(|| "Cannot discharge best cell")?
            {
                println!("Best cell discharging");
            } else {
                println!("Discharge command refused");
            }
        }
        CliCommands::Balance { .. } => unreachable!(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    match args.command.clone() {
        CliCommands::Balance {
            threshold,
            cadence,
            log_dir,
        } => {
            // the log file is keyed by the battery serial number, so the
            // logger comes up only after the battery has identified itself
            run_balance(&args, threshold, cadence, log_dir)
        }
        command => {
            let _log_handle = logging_init(args.verbose.log_level_filter());
            run_command(&args, command)
        }
    }
}
