use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use smallbattmod_lib::balancer;
use std::path::PathBuf;
use std::time::Duration;

fn address_in_range(s: &str) -> Result<u8, String> {
    clap_num::number_range(s, 0, 250)
}

fn cell_in_range(s: &str) -> Result<u8, String> {
    clap_num::number_range(s, 0, 7)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the battery summary: state, error, voltages, temperature, power
    Summary,
    /// Show the version summary: serial numbers, ratings, firmware
    Version,
    /// Show the 8 individual cell voltages
    CellVoltages,
    /// Show the unit address (battery must be the only unit on the bus)
    Address,
    /// Assign a new unit address (battery must be the only unit on the bus)
    SetAddress {
        /// The new address, 0-250 (0 is the broadcast address)
        #[clap(value_parser = address_in_range)]
        address: u8,
    },
    /// Put the battery to sleep
    Sleep {
        /// Seconds to wait before going to sleep
        #[clap(default_value_t = 0)]
        seconds: u32,
    },
    /// Turn the battery off (also clears any latched error state)
    Off,
    /// Power-cycle the battery to clear its error state
    Reset,
    /// Discharge a single cell for balancing
    BalanceCell {
        /// The cell to discharge, 0-7
        #[clap(value_parser = cell_in_range)]
        cell: u8,
    },
    /// Let the firmware pick and discharge its own best candidate cell
    BalanceBest,
    /// Run the balancing loop until the pack converges, then turn off
    Balance {
        /// Cell imbalance threshold in volts
        #[clap(long, default_value_t = balancer::DEFAULT_IMBALANCE_THRESHOLD)]
        threshold: f32,
        /// Target period of one balancing loop iteration (e.g., "1m", "90s")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "1m")]
        cadence: Duration,
        /// Directory for the per-battery log file
        #[clap(long, default_value = ".")]
        log_dir: PathBuf,
    },
}

const fn about_text() -> &'static str {
    "Bluefin SmallBattMod command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on
    /// Windows). When omitted, every available port is probed with a
    /// version query and the first responding one is used.
    #[arg(short, long)]
    pub device: Option<String>,

    /// Unit address to direct commands at, 0-250 (0 is the broadcast
    /// address and works for a single battery on the bus)
    #[arg(short, long, default_value_t = 0, value_parser = address_in_range)]
    pub address: u8,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,
}
