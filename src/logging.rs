use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Filters and formats kernel messages before they reach the console fan-out.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			let cpu = crate::arch::x86_64::kernel::core_local::try_core_id();
			let level = ColorLevel(record.level());
			match cpu {
				Some(cpu) => println!("[{cpu}][{level}] {}", record.args()),
				None => println!("[-][{level}] {}", record.args()),
			}
		}
	}
}

struct ColorLevel(Level);

impl core::fmt::Display for ColorLevel {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let level = self.0;

		if no_color() {
			write!(f, "{level}")
		} else {
			let color = match level {
				Level::Trace => AnsiColor::Magenta,
				Level::Debug => AnsiColor::Blue,
				Level::Info => AnsiColor::Green,
				Level::Warn => AnsiColor::Yellow,
				Level::Error => AnsiColor::Red,
			};

			let style = anstyle::Style::new().fg_color(Some(color.into()));
			write!(f, "{style}{level}{style:#}")
		}
	}
}

fn no_color() -> bool {
	option_env!("NO_COLOR").is_some_and(|val| !val.is_empty())
}

pub unsafe fn init() {
	log::set_logger(&LOGGER).expect("Can't initialize logger");
	// The compile-time default; `update_level` applies the command line.
	log::set_max_level(LevelFilter::Info);
}

/// Raises the level to `debug` once the `debug` command-line flag is parsed.
pub fn update_level(debug: bool) {
	if debug {
		log::set_max_level(LevelFilter::Debug);
	}
}
