// Example configs under docs/ stay loadable

use stansim::config::{ErrorMode, PipelineConfig};
use std::path::PathBuf;

fn docs_example(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../docs/examples")
        .join(name)
}

#[test]
fn test_linear_sbc_example_is_valid() {
    let path = docs_example("linear_sbc.json");
    let config = PipelineConfig::from_file(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.n_replicates(), 100);
    assert_eq!(config.error, ErrorMode::Continue);
    assert_eq!(config.models.len(), 1);
    assert_eq!(config.models[0].name, "linear");
    assert!(config.models[0].path.exists());
    assert_eq!(
        config.summary_columns().unwrap(),
        vec!["mean", "sd", "q2.5", "q50", "q97.5", "rhat", "ess_basic"]
    );
    assert!(config.sbc.is_some());
}
