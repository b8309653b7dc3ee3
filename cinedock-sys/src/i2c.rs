// SPDX-License-Identifier: GPL-3.0-only

//! Minimal I2C register access for the CFE HAT.
//!
//! The HAT exposes one status byte (bit 0 = insert latch, bit 1 = eject
//! button) and accepts one LED byte. Single-byte reads and writes through
//! i2c-dev are exactly the SMBus receive/send-byte transactions the HAT
//! firmware expects.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use crate::{Result, SysError};

const I2C_SLAVE: libc::c_ulong = 0x0703;

nix::ioctl_write_int_bad!(set_slave_address, I2C_SLAVE);

pub struct I2cBus {
    file: File,
}

impl I2cBus {
    /// Open `/dev/i2c-<bus>` and select the target address. Fails when
    /// the bus is absent, which callers treat as "no HAT fitted".
    pub fn open(bus: u8, address: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/i2c-{bus}"))?;
        unsafe { set_slave_address(file.as_raw_fd(), address as libc::c_int) }.map_err(
            |errno| SysError::OperationFailed(format!("I2C_SLAVE ioctl for 0x{address:02x}: {errno}")),
        )?;
        Ok(Self { file })
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.file.write_all(&[value])?;
        Ok(())
    }
}
