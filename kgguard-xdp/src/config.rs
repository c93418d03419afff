//! Runtime toggles, one `u32` per slot. 0 or unset disables a feature.

use std::sync::atomic::{AtomicU32, Ordering};

use kgguard_common::{
    CFG_HARD_BLOCKING, CFG_INTERFACE_MODE, CFG_MAINTENANCE_MODE, CFG_RATE_LIMIT_PPS, CONFIG_SLOTS,
};

use crate::error::ConfigError;
use crate::parsing::LinkMode;

#[derive(Default)]
pub struct ConfigMap {
    slots: [AtomicU32; CONFIG_SLOTS],
}

impl ConfigMap {
    pub fn set(&self, key: u32, value: u32) -> Result<(), ConfigError> {
        let slot = self
            .slots
            .get(key as usize)
            .ok_or(ConfigError::UnknownKey(key))?;
        slot.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Unknown keys read as 0.
    #[inline(always)]
    pub fn get(&self, key: u32) -> u32 {
        self.slots
            .get(key as usize)
            .map_or(0, |s| s.load(Ordering::Relaxed))
    }

    pub fn hard_blocking(&self) -> bool {
        self.get(CFG_HARD_BLOCKING) == 1
    }

    pub fn rate_limit_pps(&self) -> u32 {
        self.get(CFG_RATE_LIMIT_PPS)
    }

    pub fn maintenance_mode(&self) -> bool {
        self.get(CFG_MAINTENANCE_MODE) == 1
    }

    pub fn link_mode(&self) -> LinkMode {
        LinkMode::from_config(self.get(CFG_INTERFACE_MODE))
    }

    pub fn set_hard_blocking(&self, enabled: bool) {
        self.slots[CFG_HARD_BLOCKING as usize].store(enabled as u32, Ordering::Relaxed);
    }

    pub fn set_rate_limit_pps(&self, pps: u32) {
        self.slots[CFG_RATE_LIMIT_PPS as usize].store(pps, Ordering::Relaxed);
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        self.slots[CFG_MAINTENANCE_MODE as usize].store(enabled as u32, Ordering::Relaxed);
    }

    pub fn set_link_mode(&self, mode: LinkMode) {
        let v = match mode {
            LinkMode::Ethernet => 0,
            LinkMode::RawIp => 1,
        };
        self.slots[CFG_INTERFACE_MODE as usize].store(v, Ordering::Relaxed);
    }
}
