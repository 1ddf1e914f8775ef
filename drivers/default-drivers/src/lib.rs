pub use bdevperf::BdevPerf;
pub use spdk_perf::SpdkPerf;

/// Serializing one instance of each variant keeps the linker from
/// discarding the driver crates along with their typetag registrations.
pub fn init_drivers() {
    serde_json::to_string(&SpdkPerf::default()).unwrap();
    serde_json::to_string(&BdevPerf::default()).unwrap();
}

#[cfg(test)]
mod tests {
    use common::{config::Config, driver::Driver};

    use super::*;

    #[test]
    fn drivers_deserialize_by_type_tag() {
        let driver: Box<dyn Driver> =
            serde_yml::from_str("type: spdk_perf\nstage_stats: true\n").unwrap();
        assert_eq!(driver.name(), "spdk_perf");
        let perf = driver.downcast_ref::<SpdkPerf>().unwrap();
        assert_eq!(perf.stage_stats, Some(true));

        let driver: Box<dyn Driver> = serde_yml::from_str("type: bdevperf\n").unwrap();
        assert_eq!(driver.name(), "bdevperf");
        assert!(driver.downcast_ref::<BdevPerf>().is_some());
    }

    #[test]
    fn full_config_enumerates_its_sweep() {
        let yaml = "\
name: phase1
settings:
  device: 0000:00:04.0
  driver_program: perf
  steady_time: 30
  sampling: true
sweep:
  io_sizes: [\"4k\"]
  queue_depths: [1, 2]
  cores:
    counts: [1]
  repeats: 2
driver:
  type: spdk_perf
";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.name, "phase1");
        assert_eq!(config.driver.name(), "spdk_perf");
        let points = common::sweep::enumerate(&config.sweep).unwrap();
        assert_eq!(points.len(), 4);
    }
}
