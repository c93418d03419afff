#![no_main]

use libfuzzer_sys::fuzz_target;
use kgguard_cli::config::{BlockFile, KgConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(cfg) = toml::from_str::<KgConfig>(s) {
            let _ = cfg.link_mode();
            let _ = cfg.effective_allowlist();
        }
        let _ = serde_yaml::from_str::<BlockFile>(s);
    }
});
