//! Mock bus and delay for driver tests.
//!
//! `MockBus` behaves like a set of register-mapped chips: block writes land in
//! the register map, block reads return it, and plain reads pop pre-queued
//! responses. Every attempted transaction is logged, including failed ones.

use super::SmBus;
use crate::error::BusError;
use embedded_hal::delay::DelayNs;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction type for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    WriteByte { addr: u8, value: u8 },
    WriteBlock { addr: u8, register: u8, data: Vec<u8> },
    Read { addr: u8, len: usize },
    ReadBlock { addr: u8, register: u8, len: usize },
}

#[derive(Debug, Default)]
pub struct MockBus {
    devices: HashSet<u8>,
    registers: HashMap<(u8, u8), u8>,
    reads: HashMap<u8, VecDeque<Vec<u8>>>,
    transactions: Vec<Transaction>,
    failing_commands: HashSet<u8>,
    failing_registers: HashSet<u8>,
    offline: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `addr` acknowledge transactions.
    pub fn add_device(&mut self, addr: u8) {
        self.devices.insert(addr);
    }

    /// Preload registers starting at `register`.
    pub fn set_block(&mut self, addr: u8, register: u8, data: &[u8]) {
        self.add_device(addr);
        for (i, byte) in data.iter().enumerate() {
            self.registers
                .insert((addr, register.wrapping_add(i as u8)), *byte);
        }
    }

    pub fn register(&self, addr: u8, register: u8) -> u8 {
        self.registers.get(&(addr, register)).copied().unwrap_or(0)
    }

    /// Queue a response for the next plain read from `addr`.
    pub fn queue_read(&mut self, addr: u8, data: &[u8]) {
        self.add_device(addr);
        self.reads.entry(addr).or_default().push_back(data.to_vec());
    }

    /// Fail every `write_byte` carrying this command byte.
    pub fn fail_command(&mut self, value: u8) {
        self.failing_commands.insert(value);
    }

    /// Fail every block read or write addressing this register.
    pub fn fail_register(&mut self, register: u8) {
        self.failing_registers.insert(register);
    }

    /// Disconnect (or reconnect) every device on the bus.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn clear_failures(&mut self) {
        self.failing_commands.clear();
        self.failing_registers.clear();
        self.offline = false;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }

    pub fn clear_transactions(&mut self) {
        self.transactions.clear();
    }

    /// Command bytes sent with `write_byte` to `addr`, in order.
    pub fn commands(&self, addr: u8) -> Vec<u8> {
        self.transactions
            .iter()
            .filter_map(|t| match t {
                Transaction::WriteByte { addr: a, value } if *a == addr => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Register writes to `addr` as `(register, first data byte)`, in order.
    pub fn register_writes(&self, addr: u8) -> Vec<(u8, u8)> {
        self.transactions
            .iter()
            .filter_map(|t| match t {
                Transaction::WriteBlock {
                    addr: a,
                    register,
                    data,
                } if *a == addr => Some((*register, data.first().copied().unwrap_or(0))),
                _ => None,
            })
            .collect()
    }

    fn check(&self, addr: u8) -> Result<(), BusError> {
        if self.offline || !self.devices.contains(&addr) {
            Err(BusError::NoAcknowledge(addr))
        } else {
            Ok(())
        }
    }

    fn check_register(&self, addr: u8, register: u8) -> Result<(), BusError> {
        self.check(addr)?;
        if self.failing_registers.contains(&register) {
            return Err(BusError::NoAcknowledge(addr));
        }
        Ok(())
    }
}

impl SmBus for MockBus {
    fn write_byte(&mut self, addr: u8, value: u8) -> Result<(), BusError> {
        self.transactions.push(Transaction::WriteByte { addr, value });
        self.check(addr)?;
        if self.failing_commands.contains(&value) {
            return Err(BusError::NoAcknowledge(addr));
        }
        Ok(())
    }

    fn write_block(&mut self, addr: u8, register: u8, values: &[u8]) -> Result<(), BusError> {
        self.transactions.push(Transaction::WriteBlock {
            addr,
            register,
            data: values.to_vec(),
        });
        self.check_register(addr, register)?;
        for (i, byte) in values.iter().enumerate() {
            self.registers
                .insert((addr, register.wrapping_add(i as u8)), *byte);
        }
        Ok(())
    }

    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.transactions.push(Transaction::Read {
            addr,
            len: buf.len(),
        });
        self.check(addr)?;
        let data = self
            .reads
            .get_mut(&addr)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn read_block(&mut self, addr: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.transactions.push(Transaction::ReadBlock {
            addr,
            register,
            len: buf.len(),
        });
        self.check_register(addr, register)?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.register(addr, register.wrapping_add(i as u8));
        }
        Ok(())
    }
}

/// Delay that only accumulates the requested time.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelay {
    total_ns: Arc<AtomicU64>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ns.load(Ordering::SeqCst) / 1_000_000
    }

    pub fn total_us(&self) -> u64 {
        self.total_ns.load(Ordering::SeqCst) / 1_000
    }
}

impl DelayNs for RecordingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.fetch_add(ns as u64, Ordering::SeqCst);
    }
}
