//! Loopback RF switch.
//!
//! On the loopback FPGA image the switch that routes the loopback-tx output
//! into the loopback-rx input is driven by a user settings register. The
//! calibration pipeline only sees [`LoopbackSwitch`], so other hardware
//! generations can implement the same contract differently.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{RadioDevice, RadioError, RadioResult};

#[async_trait]
pub trait LoopbackSwitch: Send + Sync {
    /// Route the loopback-tx channel into the loopback-rx channel.
    async fn enable(&self) -> RadioResult<()>;

    /// Return the switch to its safe (non-loopback) state.
    async fn disable(&self) -> RadioResult<()>;

    /// Whether the switch currently routes the loopback path.
    async fn is_engaged(&self) -> RadioResult<bool>;
}

/// Switch driven through a 32-bit user register.
pub struct RegisterSwitch {
    radio: Arc<dyn RadioDevice>,
    bank: usize,
    addr: u32,
    loopback_value: u32,
    reset_value: u32,
}

impl RegisterSwitch {
    pub fn new(
        radio: Arc<dyn RadioDevice>,
        bank: usize,
        addr: u32,
        loopback_value: u32,
        reset_value: u32,
    ) -> Self {
        Self {
            radio,
            bank,
            addr,
            loopback_value,
            reset_value,
        }
    }

    async fn write_verified(&self, value: u32) -> RadioResult<()> {
        let before = self.radio.peek32(self.bank, self.addr).await?;
        self.radio.poke32(self.bank, self.addr, value).await?;
        let after = self.radio.peek32(self.bank, self.addr).await?;
        debug!(
            bank = self.bank,
            addr = self.addr,
            before = format_args!("{before:#x}"),
            after = format_args!("{after:#x}"),
            "[Switch] Register write"
        );
        if after != value {
            return Err(RadioError::Register {
                bank: self.bank,
                addr: self.addr,
                reason: format!("read back {after:#x}, expected {value:#x}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LoopbackSwitch for RegisterSwitch {
    async fn enable(&self) -> RadioResult<()> {
        self.write_verified(self.loopback_value).await
    }

    async fn disable(&self) -> RadioResult<()> {
        self.write_verified(self.reset_value).await
    }

    async fn is_engaged(&self) -> RadioResult<bool> {
        Ok(self.radio.peek32(self.bank, self.addr).await? == self.loopback_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{SimOptions, SimRadio};

    #[tokio::test]
    async fn enable_and_disable_write_the_register() {
        let sim = Arc::new(SimRadio::new(SimOptions::default()));
        let switch = RegisterSwitch::new(sim.clone(), 1, 0, 0x6, 0x0);

        switch.enable().await.unwrap();
        assert_eq!(sim.register(1, 0), Some(0x6));
        assert!(switch.is_engaged().await.unwrap());

        switch.disable().await.unwrap();
        assert_eq!(sim.register(1, 0), Some(0x0));
        assert!(!switch.is_engaged().await.unwrap());
    }

    #[tokio::test]
    async fn missing_register_bank_is_an_error() {
        let sim = Arc::new(SimRadio::new(SimOptions {
            registers_available: false,
            ..SimOptions::default()
        }));
        let switch = RegisterSwitch::new(sim, 1, 0, 0x6, 0x0);
        assert!(matches!(
            switch.enable().await,
            Err(RadioError::Register { bank: 1, .. })
        ));
    }
}
