use crate::protocol::{BatterySummary, DeviceError};
use crate::serialport::SmallBattMod;
use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Cells within this many volts of the pack minimum count as balanced.
pub const DEFAULT_IMBALANCE_THRESHOLD: f32 = 0.030;

/// Balancing stops for good once any cell reports this temperature.
pub const THERMAL_CUTOFF: f32 = 42.0;

/// Target period of one balancing loop iteration.
pub const LOOP_CADENCE: Duration = Duration::from_secs(60);

/// How long the battery is left off while recovering from a watchdog
/// timeout.
pub const WATCHDOG_RESET_WAIT: Duration = Duration::from_secs(5);

/// Pause after an accepted discharge command before addressing the next
/// cell.
pub const DISCHARGE_PAUSE: Duration = Duration::from_secs(1);

/// Tunables for a balancing run. All fields have working defaults.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub threshold: f32,
    pub cadence: Duration,
    pub thermal_cutoff: f32,
    pub reset_wait: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_IMBALANCE_THRESHOLD,
            cadence: LOOP_CADENCE,
            thermal_cutoff: THERMAL_CUTOFF,
            reset_wait: WATCHDOG_RESET_WAIT,
        }
    }
}

/// Coarse balance check from the pack-level min/max of a summary record.
///
/// The per-cell pass recomputes its own answer from the full voltage set;
/// the two can disagree under firmware rounding and are kept separate on
/// purpose.
pub fn is_balanced(summary: &BatterySummary, threshold: f32) -> bool {
    (summary.max_cell_voltage - summary.min_cell_voltage).abs() <= threshold
}

fn thermal_fault(max_temperature: f32, cutoff: f32) -> bool {
    max_temperature >= cutoff
}

fn pack_minimum(voltages: &[f32]) -> f32 {
    voltages.iter().copied().fold(f32::INFINITY, f32::min)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellAction {
    /// The minimum cell itself, never discharged.
    Minimum,
    /// Close enough to the minimum to leave alone.
    WithinThreshold,
    Discharge,
}

fn classify_cells(voltages: &[f32], threshold: f32) -> Vec<CellAction> {
    let minimum = pack_minimum(voltages);
    voltages
        .iter()
        .map(|&v| {
            // exact match: the device reports the minimum cell's own voltage
            if v == minimum {
                CellAction::Minimum
            } else if (v - minimum).abs() <= threshold {
                CellAction::WithinThreshold
            } else {
                CellAction::Discharge
            }
        })
        .collect()
}

/// Drives a battery through balancing until the pack converges or a fault
/// aborts the run.
///
/// One run moves through: check, discharge pass over the non-minimum cells,
/// re-check, then sleep out the remainder of the cadence. It ends by turning
/// the battery off once balanced, or with [`Error::ThermalCutoff`] if any
/// cell reaches the thermal limit (the pack must cool externally before
/// another attempt). Transport and parse errors abort the run as-is.
pub struct Balancer {
    bms: SmallBattMod,
    config: BalanceConfig,
}

impl Balancer {
    pub fn new(bms: SmallBattMod, config: BalanceConfig) -> Self {
        Self { bms, config }
    }

    pub fn run(&mut self) -> Result<()> {
        let summary = self.bms.get_summary()?;
        log::info!("current temperature: {:.1}\u{b0}C", summary.max_temperature);
        log::info!("minimum cell voltage: {:.3}V", summary.min_cell_voltage);
        log::info!("maximum cell voltage: {:.3}V", summary.max_cell_voltage);
        log::info!("battery state: {}", summary.state);
        log::info!("error state: {}", summary.error);
        if is_balanced(&summary, self.config.threshold) {
            log::info!("battery is balanced, turning off");
            self.bms.off()?;
            return Ok(());
        }

        log::info!("starting balancing loop");
        let mut iteration = 0u32;
        loop {
            iteration += 1;
            let started = Instant::now();

            let summary = self.bms.get_summary()?;
            log::info!("balance loop {iteration}");
            log::info!("current temperature: {:.1}\u{b0}C", summary.max_temperature);
            if thermal_fault(summary.max_temperature, self.config.thermal_cutoff) {
                log::error!(
                    "maximum cell temperature {:.1}\u{b0}C exceeds {:.1}\u{b0}C, \
                     allow the battery to cool down before balancing again",
                    summary.max_temperature,
                    self.config.thermal_cutoff
                );
                return Err(Error::ThermalCutoff(summary.max_temperature));
            }

            log::info!("balancing cells");
            if self.balance_pass()? {
                log::info!("battery is balanced, turning off");
                self.bms.off()?;
                return Ok(());
            }

            let summary = self.bms.get_summary()?;
            if is_balanced(&summary, self.config.threshold) {
                std::thread::sleep(Duration::from_millis(500));
                log::info!("battery is balanced, turning off");
                self.bms.off()?;
                return Ok(());
            }

            let wait = self.config.cadence.saturating_sub(started.elapsed());
            log::info!("starting next loop in {}s", wait.as_secs());
            std::thread::sleep(wait);
        }
    }

    /// One discharge pass over the non-minimum cells. Returns true when
    /// every cell is already within the threshold of the pack minimum.
    fn balance_pass(&mut self) -> Result<bool> {
        let voltages = self.bms.get_cell_voltages()?;
        log::debug!("cell voltages: {voltages:?}");
        let actions = classify_cells(&voltages, self.config.threshold);
        if !actions.contains(&CellAction::Discharge) {
            log::info!(
                "all cells are within {:.0}mV of each other",
                self.config.threshold * 1000.0
            );
            return Ok(true);
        }
        let minimum = pack_minimum(&voltages);
        for (cell, action) in actions.iter().enumerate() {
            match action {
                CellAction::Minimum => {
                    log::info!("cell #{cell} is the minimum cell");
                }
                CellAction::WithinThreshold => {
                    log::info!(
                        "cell #{cell} is within {:.0}mV of the minimum cell",
                        self.config.threshold * 1000.0
                    );
                }
                CellAction::Discharge => {
                    self.discharge_cell(cell as u8, voltages[cell] - minimum)?;
                }
            }
        }
        Ok(false)
    }

    /// Issues one discharge command, recovering once from a watchdog
    /// timeout. Any other rejection is logged and the pass moves on.
    fn discharge_cell(&mut self, cell: u8, above_minimum: f32) -> Result<()> {
        if self.bms.balance_cell(cell)? {
            log::info!(
                "cell #{cell} discharging, {:.0}mV above the minimum cell",
                above_minimum * 1000.0
            );
            std::thread::sleep(DISCHARGE_PAUSE);
            return Ok(());
        }

        log::info!("unable to discharge cell #{cell}");
        let error = self.bms.get_error_state()?;
        if error == DeviceError::Watchdog {
            log::error!("discharge rejected: watchdog timeout, resetting battery");
            self.bms.reset(self.config.reset_wait)?;
            if self.bms.balance_cell(cell)? {
                log::info!(
                    "cell #{cell} discharging after reset, {:.0}mV above the minimum cell",
                    above_minimum * 1000.0
                );
                std::thread::sleep(DISCHARGE_PAUSE);
            } else {
                log::error!("cell #{cell} still refused discharge after reset");
            }
        } else {
            log::error!("discharge of cell #{cell} rejected: {error}");
        }
        Ok(())
    }
}
