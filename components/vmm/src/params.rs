//! Device registry and boot command-line parsing
//!
//! Devices are instantiated from a command line such as
//! `hostdisk:0,1 hostdisk:1,0x2`. Each word is `name` or `name:args`; the
//! name selects a registered creation function, which is called once per
//! word, left to right, with up to [`ARG_COUNT`] numeric arguments and the
//! raw argument text.

use crate::{Motherboard, Result, VmmError};

/// Number of numeric arguments passed to a creation function
pub const ARG_COUNT: usize = 16;

/// Value of an argument that was not given or is not a number
pub const ARG_MISSING: u64 = !0;

const WORD_SEPARATORS: &[char] = &[' ', '\t', '\r', '\n', '\x0c'];
const ARG_SEPARATORS: &[char] = &[',', '+'];

/// Creation function of a device
pub type Creator = Box<dyn Fn(&Motherboard, &[u64; ARG_COUNT], &str) -> Result<()>>;

struct Entry {
    name: &'static str,
    help: &'static str,
    create: Creator,
}

/// Named device creation functions
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Vec<Entry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the creation function of device `name`
    pub fn register<F>(&mut self, name: &'static str, help: &'static str, create: F) -> Result<()>
    where
        F: Fn(&Motherboard, &[u64; ARG_COUNT], &str) -> Result<()> + 'static,
    {
        if self.find(name).is_some() {
            return Err(VmmError::DuplicateDevice { name: name.into() });
        }
        self.entries.push(Entry {
            name,
            help,
            create: Box::new(create),
        });
        log::debug!("device registry: {}", name);
        Ok(())
    }

    /// Registered device names and their help texts
    pub fn devices(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().map(|e| (e.name, e.help))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Outcome of [`Motherboard::parse_args`]
#[derive(Debug, Default)]
pub struct ParseReport {
    /// Words whose device was created
    pub created: Vec<String>,
    /// Words naming no registered device
    pub ignored: Vec<String>,
    /// Words whose creation function failed
    pub failed: Vec<(String, VmmError)>,
}

impl Motherboard {
    /// Create the devices named on `cmdline` from `registry`
    ///
    /// Unknown names and failing creation functions are logged and
    /// skipped; they never stop the remaining words.
    pub fn parse_args(&self, registry: &DeviceRegistry, cmdline: &str) -> ParseReport {
        let mut report = ParseReport::default();
        for word in cmdline.split(WORD_SEPARATORS).filter(|w| !w.is_empty()) {
            let (name, args) = word.split_once(':').unwrap_or((word, ""));
            let Some(entry) = registry.find(name) else {
                log::warn!("ignored parameter: '{}'", word);
                report.ignored.push(word.into());
                continue;
            };

            let (argv, raw) = parse_argv(args);
            match (entry.create)(self, &argv, raw) {
                Ok(()) => {
                    log::info!("created {}", word);
                    report.created.push(word.into());
                }
                Err(err) => {
                    log::error!("{}: {}", word, err);
                    report.failed.push((word.into(), err));
                }
            }
        }
        report
    }
}

/// Split `args` into numeric arguments, returning them with the consumed text
fn parse_argv(args: &str) -> ([u64; ARG_COUNT], &str) {
    let mut argv = [ARG_MISSING; ARG_COUNT];
    let mut end = 0;
    for (index, arg) in args.split(ARG_SEPARATORS).enumerate() {
        if index == ARG_COUNT {
            log::debug!("arguments beyond {} dropped: '{}'", ARG_COUNT, &args[end..]);
            break;
        }
        if index > 0 {
            end += 1;
        }
        end += arg.len();
        argv[index] = parse_number(arg).unwrap_or(ARG_MISSING);
    }
    (argv, &args[..end])
}

/// Decimal or `0x`-prefixed hexadecimal number
fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
