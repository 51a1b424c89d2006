//! Central parsing of the command-line parameters.
//!
//! The command line is a whitespace-separated sequence of `key[=value]`
//! tokens matched against a registry of typed parameters: booleans with
//! the conventional literal sets (a bare key means true), strings with
//! length capping, and numbers parsed with C-style radix guessing.

use core::str::FromStr;

use heapless::{String, Vec};
use hermit_sync::OnceCell;

use crate::arch::x86_64::kernel::serial::ComConfig;

pub const MAX_TESTS: usize = 16;
pub const MAX_TEST_NAME: usize = 32;

/// Parameter types of the registry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParamType {
	String,
	ULong,
	Bool,
}

/// The registry of recognized keys. Unknown keys are skipped.
pub const PARAMS: [(&str, ParamType); 13] = [
	("debug", ParamType::Bool),
	("keyboard", ParamType::Bool),
	("pit", ParamType::Bool),
	("apic_timer", ParamType::Bool),
	("hpet", ParamType::Bool),
	("fpu", ParamType::Bool),
	("qemu_console", ParamType::Bool),
	("poweroff", ParamType::Bool),
	("com1", ParamType::String),
	("com2", ParamType::String),
	("com3", ParamType::String),
	("com4", ParamType::String),
	("tests", ParamType::String),
];

/// Parsed command-line state with its compile-time defaults.
#[derive(Clone, Debug)]
pub struct Options {
	pub debug: bool,
	pub keyboard: bool,
	pub pit: bool,
	pub apic_timer: bool,
	pub hpet: bool,
	pub fpu: bool,
	pub qemu_console: bool,
	pub poweroff: bool,
	/// Validated COM configurations; `None` keeps the port defaults.
	pub com: [Option<ComConfig>; 4],
	pub tests: Vec<String<MAX_TEST_NAME>, MAX_TESTS>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			debug: false,
			keyboard: true,
			pit: false,
			apic_timer: false,
			hpet: false,
			fpu: false,
			qemu_console: false,
			poweroff: true,
			com: [None; 4],
			tests: Vec::new(),
		}
	}
}

/// C-style unsigned parse: `0x` prefix is hex, a leading `0` octal,
/// decimal otherwise.
pub fn parse_number(text: &str) -> Option<u64> {
	if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
		u64::from_str_radix(hex, 16).ok()
	} else if text.starts_with('0') && text.len() > 1 {
		u64::from_str_radix(&text[1..], 8).ok()
	} else {
		u64::from_str(text).ok()
	}
}

/// The two ordered literal sets of boolean parameters.
pub fn parse_bool(value: &str) -> Option<bool> {
	match value {
		"yes" | "on" | "true" | "enable" | "1" => Some(true),
		"no" | "off" | "false" | "disable" | "0" => Some(false),
		_ => None,
	}
}

fn set_bool(options: &mut Options, key: &str, value: bool) {
	match key {
		"debug" => options.debug = value,
		"keyboard" => options.keyboard = value,
		"pit" => options.pit = value,
		"apic_timer" => options.apic_timer = value,
		"hpet" => options.hpet = value,
		"fpu" => options.fpu = value,
		"qemu_console" => options.qemu_console = value,
		"poweroff" => options.poweroff = value,
		_ => unreachable!(),
	}
}

fn set_string(options: &mut Options, key: &str, value: &str) {
	match key {
		"com1" | "com2" | "com3" | "com4" => {
			let index = (key.as_bytes()[3] - b'1') as usize;
			let parsed = ComConfig::parse(value);
			if parsed.is_none() {
				warn!("Ignoring invalid {key}= parameter \"{value}\"");
			}
			options.com[index] = parsed;
		}
		"tests" => {
			for name in value.split(',').filter(|name| !name.is_empty()) {
				let mut owned = String::new();
				// Length capping, the way every string parameter works.
				let take = name.len().min(MAX_TEST_NAME);
				if take < name.len() {
					warn!("Test name \"{name}\" truncated to {MAX_TEST_NAME} bytes");
				}
				owned.push_str(&name[..take]).ok();
				if options.tests.push(owned).is_err() {
					warn!("Too many tests requested, dropping the rest");
					break;
				}
			}
		}
		_ => unreachable!(),
	}
}

/// Parses one full command line into an [`Options`] value.
pub fn parse(cmdline: &str) -> Options {
	let mut options = Options::default();

	for token in cmdline.split_whitespace() {
		let (key, value) = match token.split_once('=') {
			Some((key, value)) => (key, Some(value)),
			None => (token, None),
		};

		let Some(&(_, kind)) = PARAMS.iter().find(|(name, _)| *name == key) else {
			debug!("Ignoring unknown command-line key \"{key}\"");
			continue;
		};

		match kind {
			ParamType::Bool => {
				// A bare key means true; an unrecognized literal is
				// treated as set, matching the original behavior.
				let value = match value {
					None => true,
					Some(literal) => parse_bool(literal).unwrap_or(true),
				};
				set_bool(&mut options, key, value);
			}
			ParamType::String => {
				set_string(&mut options, key, value.unwrap_or(""));
			}
			ParamType::ULong => {
				// No core key is numeric today; the type exists for
				// experiment-supplied registries.
			}
		}
	}

	options
}

static OPTIONS: OnceCell<Options> = OnceCell::new();

/// Parses the loader-supplied command line. BSP bring-up only.
#[cfg(target_os = "none")]
pub fn init() {
	use crate::arch::x86_64::kernel::{multiboot, serial};

	let cmdline = multiboot::cmdline();
	info!("Command line: \"{cmdline}\"");

	let options = parse(cmdline);
	crate::logging::update_level(options.debug);
	for (index, com) in options.com.iter().enumerate() {
		if let Some(config) = com {
			serial::configure(index, *config);
		}
	}

	OPTIONS.set(options).expect("Command line parsed twice");
}

pub fn options() -> &'static Options {
	OPTIONS.get().expect("Command line not parsed yet")
}

pub fn is_debug() -> bool {
	OPTIONS.get().is_some_and(|options| options.debug)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_the_documented_values() {
		let options = parse("");
		assert!(!options.debug);
		assert!(options.keyboard);
		assert!(options.poweroff);
		assert!(!options.pit);
		assert!(options.tests.is_empty());
	}

	#[test]
	fn bare_keys_are_true() {
		let options = parse("debug fpu");
		assert!(options.debug);
		assert!(options.fpu);
	}

	#[test]
	fn bool_literal_sets() {
		assert!(!parse("keyboard=off").keyboard);
		assert!(!parse("keyboard=disable").keyboard);
		assert!(!parse("keyboard=0").keyboard);
		assert!(parse("pit=yes").pit);
		assert!(parse("pit=enable").pit);
		assert!(parse("pit=1").pit);
	}

	#[test]
	fn bool_parsing_is_idempotent() {
		for literal in ["yes", "on", "true", "enable", "1"] {
			assert_eq!(parse_bool(literal), Some(true));
			assert_eq!(parse_bool(literal), Some(true));
		}
		for literal in ["no", "off", "false", "disable", "0"] {
			assert_eq!(parse_bool(literal), Some(false));
			assert_eq!(parse_bool(literal), Some(false));
		}
		assert_eq!(parse_bool("maybe"), None);
	}

	#[test]
	fn com_parameters_validate_or_fall_back() {
		let options = parse("com1=0x3f8,115200,8,n,1 com2=0xdead");
		assert!(options.com[0].is_some());
		assert!(options.com[1].is_none());
	}

	#[test]
	fn tests_list_splits_on_commas() {
		let options = parse("tests=unit_tests,cache_probe debug=1");
		assert_eq!(options.tests.len(), 2);
		assert_eq!(options.tests[0].as_str(), "unit_tests");
		assert_eq!(options.tests[1].as_str(), "cache_probe");
		assert!(options.debug);
	}

	#[test]
	fn unknown_keys_are_skipped() {
		let options = parse("frobnicate=7 debug");
		assert!(options.debug);
	}

	#[test]
	fn number_radix_guessing() {
		assert_eq!(parse_number("0x3f8"), Some(0x3f8));
		assert_eq!(parse_number("0755"), Some(0o755));
		assert_eq!(parse_number("115200"), Some(115_200));
		assert_eq!(parse_number("zzz"), None);
	}
}
