//! Config serialization (requires the `serde` feature).

#![cfg(feature = "serde")]

use dnnconv::{ConvConfig, Filler};

#[test]
fn test_config_json_round_trip() {
    let config = ConvConfig {
        weight_filler: Filler::Gaussian { std: 0.01 },
        bias_filler: Filler::Constant(0.1),
        ..ConvConfig::square(32, 5, 2, 2).with_group(4).with_name("conv2").with_seed(7)
    };

    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("\"conv2\""));
    let restored: ConvConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, config);
    assert!(restored.validate().is_ok());
}
