#![no_main]
use libfuzzer_sys::fuzz_target;
use multifetch::MultiplexConfig;

fuzz_target!(|data: &str| {
    // Decoding and validating arbitrary TOML must never panic
    let Ok(config) = toml::from_str::<MultiplexConfig>(data) else {
        assert!(MultiplexConfig::from_toml_str(data).is_err());
        return;
    };
    let valid = config.validate().is_ok();
    assert_eq!(MultiplexConfig::from_toml_str(data).is_ok(), valid);
});
