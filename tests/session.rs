//! Full-session tests against a scripted in-memory serial port.
//!
//! The fake port checks every frame the client writes against a script and
//! answers with canned device responses, so whole balancing sessions can run
//! without hardware.
#![cfg(feature = "serialport")]

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use smallbattmod_lib::balancer::{BalanceConfig, Balancer};
use smallbattmod_lib::protocol::{DeviceError, State};
use smallbattmod_lib::serialport::SmallBattMod;
use smallbattmod_lib::Error;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Shared {
    /// Front of the queue is the next expected frame and its response.
    script: VecDeque<(String, String)>,
    sent: Vec<String>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

#[derive(Debug, Clone)]
struct FakePort {
    shared: Arc<Mutex<Shared>>,
    timeout: Duration,
}

fn scripted(steps: &[(&str, &str)]) -> (FakePort, Arc<Mutex<Shared>>) {
    let shared = Arc::new(Mutex::new(Shared {
        script: steps
            .iter()
            .map(|(frame, response)| (frame.to_string(), response.to_string()))
            .collect(),
        ..Shared::default()
    }));
    let port = FakePort {
        shared: Arc::clone(&shared),
        timeout: Duration::from_secs(1),
    };
    (port, shared)
}

impl Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        shared.tx.extend_from_slice(buf);
        while let Some(pos) = shared.tx.iter().position(|&b| b == b'\n') {
            let frame_bytes: Vec<u8> = shared.tx.drain(..=pos).collect();
            let frame = String::from_utf8(frame_bytes)
                .expect("frames are ASCII")
                .trim_end()
                .to_string();
            let (expected, response) = shared
                .script
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected frame {frame:?}"));
            assert_eq!(frame, expected, "device got an unexpected frame");
            shared.sent.push(frame);
            shared.rx.extend(response.as_bytes());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        let n = buf.len().min(shared.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = shared.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl SerialPort for FakePort {
    fn name(&self) -> Option<String> {
        Some("fake".into())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(9600)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        Ok(DataBits::Eight)
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        Ok(FlowControl::None)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        Ok(Parity::None)
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        Ok(StopBits::One)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> serialport::Result<()> {
        Ok(())
    }

    fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
        Ok(())
    }

    fn set_flow_control(&mut self, _flow_control: FlowControl) -> serialport::Result<()> {
        Ok(())
    }

    fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
        Ok(())
    }

    fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        Ok(self.shared.lock().unwrap().rx.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        Ok(0)
    }

    fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        match buffer_to_clear {
            ClearBuffer::Input => shared.rx.clear(),
            ClearBuffer::Output => shared.tx.clear(),
            ClearBuffer::All => {
                shared.rx.clear();
                shared.tx.clear();
            }
        }
        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        Ok(Box::new(self.clone()))
    }

    fn set_break(&self) -> serialport::Result<()> {
        Ok(())
    }

    fn clear_break(&self) -> serialport::Result<()> {
        Ok(())
    }
}

fn summary_response(state: char, error: char, max_temp: f32, min: f32, max: f32) -> String {
    format!(
        "#00q0\r\n$02q0  {state}{error}   26.42  0.00  {max_temp:.1}  {min:.3}  {max:.3}  0  0.0  0:00:13  n  0  0  300 \r\n"
    )
}

fn version_response() -> String {
    "#00z0\r\n$02z0  00  m  170364  12345  25.9  100.0  SBM G5 FW v2.10 \r\n".to_string()
}

fn cells_response(voltages: &[f32; 8]) -> String {
    let mut response = "#00q1\r\n".to_string();
    for voltage in voltages {
        response.push_str(&format!("  {voltage:.3}"));
    }
    response.push_str(" \r\n");
    response
}

fn ack_response(cell: u8, accepted: bool) -> String {
    format!(
        "#00b{cell}\r\n$02b{cell}  {} \r\n",
        if accepted { 1 } else { 0 }
    )
}

/// An already balanced pack gets powered off without the controller ever
/// entering the discharge sub-loop.
#[test]
fn balanced_pack_is_powered_off_immediately() {
    let balanced = summary_response('f', '-', 23.5, 3.300, 3.310);
    let (port, shared) = scripted(&[
        ("#00z0", &version_response()),
        ("#00q0", &balanced),
        ("#00q0", &balanced),
        ("#00bf", ""),
    ]);

    let mut bms = SmallBattMod::from_port(Box::new(port), 0).unwrap();
    let versum = bms.get_version_summary().unwrap();
    assert_eq!(versum.sn, 12345);
    let summary = bms.get_summary().unwrap();
    assert_eq!(summary.state, State::Off);
    assert_eq!(summary.error, DeviceError::None);

    let mut balancer = Balancer::new(bms, BalanceConfig::default());
    balancer.run().unwrap();

    let shared = shared.lock().unwrap();
    assert_eq!(shared.sent, vec!["#00z0", "#00q0", "#00q0", "#00bf"]);
    assert!(shared.script.is_empty());
}

/// One discharge pass: the high cell gets a discharge command, the rest are
/// skipped, and the run powers the battery off once the summary reports the
/// pack converged.
#[test]
fn discharge_pass_targets_only_the_high_cell() {
    let unbalanced = summary_response('b', '-', 23.5, 3.300, 3.360);
    let converged = summary_response('b', '-', 23.5, 3.300, 3.305);
    let voltages = [3.300, 3.300, 3.300, 3.300, 3.300, 3.300, 3.300, 3.360];
    let (port, shared) = scripted(&[
        ("#00q0", &unbalanced),
        ("#00q0", &unbalanced),
        ("#00q1", &cells_response(&voltages)),
        ("#00b7", &ack_response(7, true)),
        ("#00q0", &converged),
        ("#00bf", ""),
    ]);

    let bms = SmallBattMod::from_port(Box::new(port), 0).unwrap();
    let config = BalanceConfig {
        cadence: Duration::ZERO,
        ..BalanceConfig::default()
    };
    Balancer::new(bms, config).run().unwrap();

    let shared = shared.lock().unwrap();
    assert_eq!(
        shared.sent,
        vec!["#00q0", "#00q0", "#00q1", "#00b7", "#00q0", "#00bf"]
    );
    assert!(shared.script.is_empty());
}

/// A watchdog-timeout rejection power-cycles the battery and retries the
/// discharge once. The retry deliberately passes the same cell index again
/// instead of leaving the choice to the firmware.
#[test]
fn watchdog_timeout_resets_and_retries_same_cell() {
    let unbalanced = summary_response('b', '-', 23.5, 3.300, 3.360);
    let watchdog = summary_response('f', 'm', 23.5, 3.300, 3.360);
    let converged = summary_response('b', '-', 23.5, 3.300, 3.305);
    let voltages = [3.300, 3.300, 3.300, 3.300, 3.300, 3.300, 3.300, 3.360];
    let (port, shared) = scripted(&[
        ("#00q0", &unbalanced),
        ("#00q0", &unbalanced),
        ("#00q1", &cells_response(&voltages)),
        ("#00b7", &ack_response(7, false)),
        ("#00q0", &watchdog),
        ("#00bf", ""),
        ("#00q0", &unbalanced),
        ("#00b7", &ack_response(7, true)),
        ("#00q0", &converged),
        ("#00bf", ""),
    ]);

    let bms = SmallBattMod::from_port(Box::new(port), 0).unwrap();
    let config = BalanceConfig {
        cadence: Duration::ZERO,
        reset_wait: Duration::ZERO,
        ..BalanceConfig::default()
    };
    Balancer::new(bms, config).run().unwrap();

    let shared = shared.lock().unwrap();
    assert_eq!(
        shared.sent,
        vec![
            "#00q0", "#00q0", "#00q1", "#00b7", "#00q0", "#00bf", "#00q0", "#00b7", "#00q0",
            "#00bf"
        ]
    );
    assert!(shared.script.is_empty());
}

/// A rejection with a non-watchdog error code is logged and skipped; the
/// pass continues without a reset.
#[test]
fn other_rejections_skip_the_cell_without_a_reset() {
    let unbalanced = summary_response('b', '-', 23.5, 3.300, 3.360);
    let over_temp = summary_response('b', 'T', 23.5, 3.300, 3.360);
    let converged = summary_response('b', '-', 23.5, 3.300, 3.305);
    let voltages = [3.300, 3.300, 3.300, 3.300, 3.300, 3.300, 3.300, 3.360];
    let (port, shared) = scripted(&[
        ("#00q0", &unbalanced),
        ("#00q0", &unbalanced),
        ("#00q1", &cells_response(&voltages)),
        ("#00b7", &ack_response(7, false)),
        ("#00q0", &over_temp),
        ("#00q0", &converged),
        ("#00bf", ""),
    ]);

    let bms = SmallBattMod::from_port(Box::new(port), 0).unwrap();
    let config = BalanceConfig {
        cadence: Duration::ZERO,
        ..BalanceConfig::default()
    };
    Balancer::new(bms, config).run().unwrap();

    let shared = shared.lock().unwrap();
    assert_eq!(
        shared.sent,
        vec!["#00q0", "#00q0", "#00q1", "#00b7", "#00q0", "#00q0", "#00bf"]
    );
}

/// The thermal guard aborts the whole run, leaving the device as-is.
#[test]
fn thermal_cutoff_aborts_the_run() {
    let unbalanced = summary_response('b', '-', 23.5, 3.300, 3.360);
    let hot = summary_response('b', '-', 42.0, 3.300, 3.360);
    let (port, shared) = scripted(&[("#00q0", &unbalanced), ("#00q0", &hot)]);

    let bms = SmallBattMod::from_port(Box::new(port), 0).unwrap();
    let result = Balancer::new(bms, BalanceConfig::default()).run();
    assert!(matches!(result, Err(Error::ThermalCutoff(t)) if t == 42.0));

    let shared = shared.lock().unwrap();
    assert_eq!(shared.sent, vec!["#00q0", "#00q0"]);
    assert!(shared.script.is_empty());
}

/// Facade operations resolve the session address into every frame, and the
/// broadcast-only operations keep the "00" token.
#[test]
fn facade_commands_use_the_resolved_address() {
    let voltages = [3.301, 3.302, 3.303, 3.304, 3.305, 3.306, 3.307, 3.308];
    let (port, shared) = scripted(&[
        ("#0aq1", &cells_response(&voltages)),
        ("#0abf", ""),
        ("#00?8 05", ""),
        ("#00?0", "#00?0\r\n 0a \r\n"),
        ("#0ab3", "#0ab3\r\n$02b3  1 \r\n"),
    ]);

    let mut bms = SmallBattMod::from_port(Box::new(port), 10).unwrap();
    assert_eq!(bms.get_cell_voltages().unwrap()[0], 3.301);
    bms.off().unwrap();
    bms.set_address(smallbattmod_lib::protocol::Address::new(5).unwrap())
        .unwrap();
    assert_eq!(bms.get_address().unwrap().value(), 10);
    assert!(bms.balance_cell(3).unwrap());
    assert!(matches!(bms.balance_cell(8), Err(Error::InvalidCell(8))));

    let shared = shared.lock().unwrap();
    assert_eq!(
        shared.sent,
        vec!["#0aq1", "#0abf", "#00?8 05", "#00?0", "#0ab3"]
    );
    assert!(shared.script.is_empty());
}
