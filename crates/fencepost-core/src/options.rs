//! The `FENCEPOST_OPTIONS` string.
//!
//! Comma separated `key=value` pairs and bare tokens:
//! - `debug=0x<hex>` sets the whole flag mask
//! - `log=<path>` names the log file
//! - `inter=<n>` runs the heap validator every `n` operations
//! - `lockon=<n>` sets the number of lock fast-path retries
//! - `addr=0x<hex>[:<count>]` watches one user pointer
//! - any token or tag name ORs its flags into the mask
//!
//! Parsing borrows the input and never allocates, so it is safe to run from
//! inside the allocator.

use core::fmt;
use thiserror::Error;

use crate::flags::{DebugFlags, tag_flags, token_flag};

const DEBUG_LABEL: &str = "debug";
const LOG_LABEL: &str = "log";
const INTERVAL_LABEL: &str = "inter";
const LOCK_ON_LABEL: &str = "lockon";
const ADDRESS_LABEL: &str = "addr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OptionsError<'a> {
    #[error("unknown debug token '{0}'")]
    UnknownToken(&'a str),
    #[error("invalid value '{value}' for '{key}'")]
    BadValue { key: &'a str, value: &'a str },
}

/// A user pointer to watch, optionally only on its `count`th appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBreak {
    pub addr: usize,
    pub count: Option<u32>,
}

/// How the flag mask is written back out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TokenStyle {
    #[default]
    Hex,
    Long,
    Short,
}

/// Parsed option settings. `None` means "not set".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Options<'a> {
    pub flags: Option<DebugFlags>,
    pub interval: Option<u32>,
    pub lock_on: Option<u32>,
    pub log_path: Option<&'a str>,
    pub address: Option<AddressBreak>,
}

impl<'a> Options<'a> {
    /// Parse an option string.
    pub fn parse(raw: &'a str) -> Result<Self, OptionsError<'a>> {
        let mut opts = Self::default();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some((key, value)) => opts.apply_pair(key.trim(), value.trim())?,
                None => {
                    let flag = token_flag(item)
                        .or_else(|| tag_flags(item))
                        .ok_or(OptionsError::UnknownToken(item))?;
                    opts.flags = Some(opts.flags.unwrap_or_default() | flag);
                }
            }
        }
        Ok(opts)
    }

    fn apply_pair(&mut self, key: &'a str, value: &'a str) -> Result<(), OptionsError<'a>> {
        let bad = OptionsError::BadValue { key, value };
        match key {
            DEBUG_LABEL => {
                let bits = parse_number(value).ok_or(bad)?;
                let bits = u32::try_from(bits).map_err(|_| bad)?;
                let merged = self.flags.unwrap_or_default() | DebugFlags::from_bits_truncate(bits);
                self.flags = Some(merged);
            }
            LOG_LABEL => self.log_path = Some(value).filter(|v| !v.is_empty()),
            INTERVAL_LABEL => {
                self.interval = Some(value.parse().map_err(|_| bad)?).filter(|n| *n > 0);
            }
            LOCK_ON_LABEL => {
                self.lock_on = Some(value.parse().map_err(|_| bad)?).filter(|n| *n > 0);
            }
            ADDRESS_LABEL => self.address = Some(parse_address(value).ok_or(bad)?),
            _ => return Err(OptionsError::UnknownToken(key)),
        }
        Ok(())
    }

    /// Flag mask, empty when unset.
    #[must_use]
    pub fn flags_or_empty(&self) -> DebugFlags {
        self.flags.unwrap_or_default()
    }

    /// Writer for the canonical option string.
    #[must_use]
    pub fn render(&self, style: TokenStyle) -> Rendered<'_, 'a> {
        Rendered { opts: self, style }
    }
}

/// Display adapter returned by [`Options::render`].
pub struct Rendered<'o, 'a> {
    opts: &'o Options<'a>,
    style: TokenStyle,
}

impl fmt::Display for Rendered<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(flags) = self.opts.flags {
            match self.style {
                TokenStyle::Hex => {
                    write!(f, "{DEBUG_LABEL}={:#x}", flags.bits())?;
                    sep = ",";
                }
                TokenStyle::Long | TokenStyle::Short => {
                    for token in flags.tokens() {
                        let name = if self.style == TokenStyle::Long {
                            token.name
                        } else {
                            token.short
                        };
                        write!(f, "{sep}{name}")?;
                        sep = ",";
                    }
                }
            }
        }
        if let Some(addr) = self.opts.address {
            write!(f, "{sep}{ADDRESS_LABEL}={:#x}", addr.addr)?;
            if let Some(count) = addr.count {
                write!(f, ":{count}")?;
            }
            sep = ",";
        }
        if let Some(inter) = self.opts.interval {
            write!(f, "{sep}{INTERVAL_LABEL}={inter}")?;
            sep = ",";
        }
        if let Some(lock_on) = self.opts.lock_on {
            write!(f, "{sep}{LOCK_ON_LABEL}={lock_on}")?;
            sep = ",";
        }
        if let Some(path) = self.opts.log_path {
            write!(f, "{sep}{LOG_LABEL}={path}")?;
        }
        Ok(())
    }
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_number(raw: &str) -> Option<u64> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn parse_address(raw: &str) -> Option<AddressBreak> {
    let (addr, count) = match raw.split_once(':') {
        Some((addr, count)) => (addr, Some(count.parse().ok()?)),
        None => (raw, None),
    };
    let addr = usize::try_from(parse_number(addr)?).ok()?;
    Some(AddressBreak { addr, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_sets_nothing() {
        assert_eq!(Options::parse("").unwrap(), Options::default());
        assert_eq!(Options::parse(" , ,").unwrap(), Options::default());
    }

    #[test]
    fn hex_debug_mask_is_parsed() {
        let opts = Options::parse("debug=0x40").unwrap();
        assert_eq!(opts.flags, Some(DebugFlags::CHECK_FENCE));
    }

    #[test]
    fn tokens_and_tags_accumulate() {
        let opts = Options::parse("check-fence,lnf,runtime").unwrap();
        let flags = opts.flags_or_empty();
        assert!(flags.contains(DebugFlags::CHECK_FENCE));
        assert!(flags.contains(DebugFlags::LOG_NON_FREE));
        assert!(flags.contains(DebugFlags::CATCH_NULL));
    }

    #[test]
    fn key_value_pairs() {
        let opts = Options::parse("log=/tmp/fp.log, inter=10,lockon=5,addr=0x1000:3").unwrap();
        assert_eq!(opts.log_path, Some("/tmp/fp.log"));
        assert_eq!(opts.interval, Some(10));
        assert_eq!(opts.lock_on, Some(5));
        assert_eq!(
            opts.address,
            Some(AddressBreak {
                addr: 0x1000,
                count: Some(3)
            })
        );
    }

    #[test]
    fn zero_interval_means_unset() {
        assert_eq!(Options::parse("inter=0").unwrap().interval, None);
    }

    #[test]
    fn unknown_token_is_reported() {
        assert_eq!(
            Options::parse("check-fence,bogus"),
            Err(OptionsError::UnknownToken("bogus"))
        );
        assert_eq!(
            Options::parse("color=red"),
            Err(OptionsError::UnknownToken("color"))
        );
    }

    #[test]
    fn bad_value_names_key() {
        assert_eq!(
            Options::parse("inter=often"),
            Err(OptionsError::BadValue {
                key: "inter",
                value: "often"
            })
        );
    }

    #[test]
    fn render_hex_round_trips() {
        let raw = "debug=0x41,addr=0x2000,inter=4,log=out.log";
        let opts = Options::parse(raw).unwrap();
        let rendered = opts.render(TokenStyle::Hex).to_string();
        assert_eq!(rendered, raw);
        assert_eq!(Options::parse(&rendered).unwrap(), opts);
    }

    #[test]
    fn render_long_tokens() {
        let opts = Options::parse("cfe,lst").unwrap();
        assert_eq!(
            opts.render(TokenStyle::Long).to_string(),
            "log-stats,check-fence"
        );
        assert_eq!(opts.render(TokenStyle::Short).to_string(), "lst,cfe");
    }
}
