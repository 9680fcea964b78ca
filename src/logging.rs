use log::LevelFilter;
use log4rs::{
    append::{
        console::ConsoleAppender,
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
    init_config, Config,
};

/// The pattern to use when logging
const LOGGING_PATTERN: &str = "[{d(%Y-%m-%d %H:%M:%S)} {h({l})} {M}] {m}{n}";
/// Max log file size before rolling over to the next file (5mb)
const LOGGING_MAX_SIZE: u64 = 1024 * 1024 * 5;
/// Number of rolled files kept before deletion
const LOGGING_MAX_FILES: u32 = 8;

const LATEST_LOG: &str = "logs/steelfog.log";
const ROLLED_LOGS: &str = "logs/steelfog-{}.log";

/// Sets up log4rs with stdout and rolling file appenders and installs
/// the panic hook so crashes land in the log. Runs before any other
/// subsystem starts.
pub fn setup(logging_level: LevelFilter) {
    let pattern = Box::new(PatternEncoder::new(LOGGING_PATTERN));

    let roller = FixedWindowRoller::builder()
        .build(ROLLED_LOGS, LOGGING_MAX_FILES)
        .expect("Unable to create log roller");
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(LOGGING_MAX_SIZE)),
        Box::new(roller),
    );

    let stdout = ConsoleAppender::builder().encoder(pattern.clone()).build();
    let file = RollingFileAppender::builder()
        .encoder(pattern)
        .build(LATEST_LOG, Box::new(policy))
        .expect("Unable to create logging file appender");

    const APPENDERS: [&str; 2] = ["stdout", "file"];

    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .appender(Appender::builder().build("file", Box::new(file)))
        // Module scoped level; everything else stays at warn
        .logger(
            Logger::builder()
                .appenders(APPENDERS)
                .additive(false)
                .build("steelfog_server", logging_level),
        )
        .build(
            Root::builder()
                .appenders(APPENDERS)
                .build(LevelFilter::Warn),
        )
        .expect("Failed to create logging config");

    init_config(config).expect("Unable to initialize logger");

    log_panics::init();
}
