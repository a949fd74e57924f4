use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[clap(about, version)]
pub struct Cli {
    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,

    /// Emit decoded samples as JSON lines on stdout instead of log output
    #[clap(long)]
    pub json: bool,
}

#[repr(usize)]
#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}
