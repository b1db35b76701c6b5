//! UPS battery telemetry over I2C (INA219 fuel gauge).
//!
//! Units without the UPS HAT get safe defaults: mains power, full battery.
//! Register access goes straight through `/dev/i2c-1` with the I2C_SLAVE
//! ioctl; the INA219 is calibrated on every read since a power blip can
//! reset it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::Mutex;

use tracing::info;

const I2C_BUS: &str = "/dev/i2c-1";
const I2C_SLAVE: libc::c_ulong = 0x0703;
const INA219_ADDR: libc::c_ulong = 0x43;

const REG_BUS_VOLTAGE: u8 = 0x02;
const REG_CURRENT: u8 = 0x04;
const REG_CALIBRATION: u8 = 0x05;
const CAL_VALUE: u16 = 26868;
const CURRENT_LSB_MA: f64 = 0.1524;
const LOW_POWER_PERCENT: i32 = 10;

pub struct Ups {
    dev: Option<Mutex<File>>,
}

impl Ups {
    /// Probe the I2C bus for the UPS. Absence is not an error.
    pub fn probe() -> Self {
        match Self::open_device() {
            Some(dev) => {
                info!("UPS detected, battery monitoring enabled");
                Self {
                    dev: Some(Mutex::new(dev)),
                }
            }
            None => {
                info!("no UPS detected, battery monitoring disabled");
                Self { dev: None }
            }
        }
    }

    fn open_device() -> Option<File> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(I2C_BUS)
            .ok()?;

        let rc = unsafe { libc::ioctl(dev.as_raw_fd(), I2C_SLAVE, INA219_ADDR) };
        if rc < 0 {
            return None;
        }

        let mut dev = dev;
        // A failed probe read means no INA219 on the bus.
        read_register(&mut dev, REG_BUS_VOLTAGE).ok()?;
        Some(dev)
    }

    /// Battery charge, 0-100. Reports 100 when no UPS is present.
    pub fn battery_percent(&self) -> i32 {
        let Some(dev) = &self.dev else { return 100 };
        let Ok(raw) = read_register(&mut dev.lock().expect("ups poisoned"), REG_BUS_VOLTAGE)
        else {
            return 100;
        };

        // Bus voltage register: value >> 3, 4 mV LSB; map 3.0-4.2 V to 0-100.
        let voltage = f64::from(raw >> 3) * 0.004;
        let percent = ((voltage - 3.0) / 1.2 * 100.0) as i32;
        percent.clamp(0, 100)
    }

    /// True while external power is connected (current into the battery is
    /// zero or positive). Defaults to true without a UPS.
    pub fn on_ac_power(&self) -> bool {
        let Some(dev) = &self.dev else { return true };
        let Ok(raw) = read_register(&mut dev.lock().expect("ups poisoned"), REG_CURRENT) else {
            return true;
        };

        let current_ma = f64::from(raw) * CURRENT_LSB_MA;
        current_ma >= 0.0
    }

    /// Low-power mode: at most 10% charge and discharging. Event detection
    /// and automatic recordings stop while this holds.
    pub fn is_low_power(&self) -> bool {
        self.dev.is_some() && self.battery_percent() <= LOW_POWER_PERCENT && !self.on_ac_power()
    }
}

/// Calibrate, then read a signed 16-bit big-endian register.
fn read_register(dev: &mut File, reg: u8) -> std::io::Result<i16> {
    let cal = CAL_VALUE.to_be_bytes();
    dev.write_all(&[REG_CALIBRATION, cal[0], cal[1]])?;

    dev.write_all(&[reg])?;
    let mut buf = [0u8; 2];
    dev.read_exact(&mut buf)?;
    Ok(i16::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_ups_reports_safe_defaults() {
        let ups = Ups { dev: None };
        assert_eq!(ups.battery_percent(), 100);
        assert!(ups.on_ac_power());
        assert!(!ups.is_low_power());
    }
}
