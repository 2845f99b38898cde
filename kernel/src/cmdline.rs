//! Kernel command line parsing.
//!
//! The command line is a whitespace-separated list of `key=value` pairs.
//! Subsystems register typed parameters at boot; parsing walks the line and
//! hands each value to the matching setter. Unknown keys are logged and
//! ignored so new bootloader arguments never brick an old kernel.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::LevelFilter;
use spin::Mutex;

/// How a parameter's value string is interpreted.
#[derive(Clone, Copy)]
pub enum ParamKind {
    /// `true`/`false`/`1`/`0`
    Bool(fn(bool)),
    /// Decimal integer
    Int(fn(i64)),
    /// Raw string, stored for later retrieval
    String(fn(&str)),
    /// One of the `log` crate level names (or 0..=5)
    LogLevel(fn(LevelFilter)),
}

struct Param {
    name: &'static str,
    kind: ParamKind,
}

static PARAMS: Mutex<Vec<Param>> = Mutex::new(Vec::new());

/// Raw values seen for `String` parameters, keyed by parameter name.
static STRING_VALUES: Mutex<Vec<(&'static str, String)>> = Mutex::new(Vec::new());

/// Register a parameter. Must happen before `parse()` runs for the setter to
/// fire; late registration is allowed but only sees later `parse()` calls.
pub fn register(name: &'static str, kind: ParamKind) {
    PARAMS.lock().push(Param { name, kind });
}

/// Look up the stored value of a `String` parameter.
pub fn string_value(name: &str) -> Option<String> {
    STRING_VALUES
        .lock()
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.clone())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_loglevel(value: &str) -> Option<LevelFilter> {
    match value {
        "off" | "0" => Some(LevelFilter::Off),
        "error" | "1" => Some(LevelFilter::Error),
        "warn" | "2" => Some(LevelFilter::Warn),
        "info" | "3" => Some(LevelFilter::Info),
        "debug" | "4" => Some(LevelFilter::Debug),
        "trace" | "5" => Some(LevelFilter::Trace),
        _ => None,
    }
}

fn apply(param: &Param, value: &str) {
    match param.kind {
        ParamKind::Bool(setter) => match parse_bool(value) {
            Some(b) => setter(b),
            None => log::warn!("cmdline: {}: bad bool '{}'", param.name, value),
        },
        ParamKind::Int(setter) => match value.parse::<i64>() {
            Ok(n) => setter(n),
            Err(_) => log::warn!("cmdline: {}: bad integer '{}'", param.name, value),
        },
        ParamKind::String(setter) => {
            STRING_VALUES
                .lock()
                .push((param.name, value.to_string()));
            setter(value);
        }
        ParamKind::LogLevel(setter) => match parse_loglevel(value) {
            Some(level) => setter(level),
            None => log::warn!("cmdline: {}: bad log level '{}'", param.name, value),
        },
    }
}

/// Parse a full command line, dispatching each `key=value` pair.
pub fn parse(cmdline: &str) {
    for token in cmdline.split_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some(kv) => kv,
            None => (token, ""),
        };

        let params = PARAMS.lock();
        match params.iter().find(|p| p.name == key) {
            Some(param) => apply(param, value),
            None => log::info!("cmdline: ignoring unknown argument '{}'", token),
        }
    }
}

/// Register the core kernel parameters and parse the boot command line.
pub fn init(cmdline: &str) {
    register("loglevel", ParamKind::LogLevel(crate::logger::set_max_level));
    register("root", ParamKind::String(|_| {}));
    register("reboot_on_panic", ParamKind::Bool(set_reboot_on_panic));

    if !cmdline.is_empty() {
        log::info!("kernel command line: {}", cmdline);
        parse(cmdline);
    }
}

static REBOOT_ON_PANIC: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(false);

fn set_reboot_on_panic(value: bool) {
    REBOOT_ON_PANIC.store(value, core::sync::atomic::Ordering::Relaxed);
}

pub fn reboot_on_panic() -> bool {
    REBOOT_ON_PANIC.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    static BOOL_SEEN: AtomicBool = AtomicBool::new(false);
    static INT_SEEN: AtomicI64 = AtomicI64::new(0);

    #[test_case]
    fn typed_setters_fire() {
        register("test_flag", ParamKind::Bool(|b| BOOL_SEEN.store(b, Ordering::Relaxed)));
        register("test_num", ParamKind::Int(|n| INT_SEEN.store(n, Ordering::Relaxed)));

        parse("test_flag=true test_num=42 nonsense=1");

        assert!(BOOL_SEEN.load(Ordering::Relaxed));
        assert_eq!(INT_SEEN.load(Ordering::Relaxed), 42);
    }

    #[test_case]
    fn string_values_are_stored() {
        register("test_root", ParamKind::String(|_| {}));
        parse("test_root=/dev/hda1");
        assert_eq!(string_value("test_root").as_deref(), Some("/dev/hda1"));
    }
}
