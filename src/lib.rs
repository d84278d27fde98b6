pub mod networks;
pub mod loaders;
pub mod config;
pub mod merge;

// Re-export common types
pub use config::{load_config, MergeConfig};
pub use merge::{inspect_adapter, merge_adapter_into, merge_checkpoint, MergeReport};
pub use networks::{compute_rotation, merge_into_weight, NetworkError, OftModule};

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    pub fn init_logger() {
        init_logger_with_level(LevelFilter::Info);
    }

    pub fn init_logger_with_level(level: LevelFilter) {
        builder(level).init();
    }

    /// `RUST_LOG`, when set, overrides `level`.
    pub fn builder(level: LevelFilter) -> Builder {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, level)
            .parse_default_env();
        builder
    }

}
