//! `fencepost env`: builds `FENCEPOST_OPTIONS` values and the shell code that
//! exports them.
//!
//! The current value of the variable is the starting point. A tag or debug
//! mask replaces the flags, `plus`/`minus` tokens adjust them, and every other
//! setting given on the command line replaces its counterpart. With `clear`
//! the settings not given are dropped.

use std::fmt::Write as _;

use fencepost_core::{DebugFlags, Options, TAGS, TOKENS, TokenStyle, tag_flags, token_flag};

use crate::HarnessError;

/// Name of the variable the allocator reads.
pub const OPTIONS_ENV: &str = "FENCEPOST_OPTIONS";

const BOURNE_SHELLS: &[&str] = &["sh", "ash", "bash", "ksh", "zsh", "dash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Bourne,
    CShell,
}

impl Shell {
    /// Shell family from a `$SHELL` value; C shell when unknown.
    #[must_use]
    pub fn detect(shell: Option<&str>) -> Self {
        let name = shell
            .map(|path| path.rsplit('/').next().unwrap_or(path))
            .unwrap_or_default();
        if BOURNE_SHELLS.contains(&name) {
            Self::Bourne
        } else {
            Self::CShell
        }
    }

    /// Code that sets `var` to `value`.
    #[must_use]
    pub fn export(self, var: &str, value: &str) -> String {
        let quoted = value.replace('\'', r"'\''");
        match self {
            Self::Bourne => format!("{var}='{quoted}';\nexport {var};\n"),
            Self::CShell => format!("setenv {var} '{quoted}';\n"),
        }
    }
}

/// Settings requested on the command line.
#[derive(Debug, Default, Clone)]
pub struct EnvRequest {
    /// Tag or single token replacing the flags.
    pub tag: Option<String>,
    pub debug: Option<u32>,
    pub plus: Vec<String>,
    pub minus: Vec<String>,
    /// `0x<hex>[:<count>]`.
    pub address: Option<String>,
    /// 0 unsets.
    pub interval: Option<u32>,
    /// 0 unsets.
    pub lock_on: Option<u32>,
    pub log: Option<String>,
    pub clear: bool,
    /// Drop the other settings when a tag is given.
    pub remove_with_tag: bool,
    /// Overrides `remove_with_tag`.
    pub keep: bool,
}

/// Result of applying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange<'a> {
    pub options: Options<'a>,
    /// Whether anything was set, so that the variable must be exported.
    pub changed: bool,
    pub warnings: Vec<String>,
}

fn flag_by_name(name: &str) -> Result<DebugFlags, HarnessError> {
    token_flag(name)
        .or_else(|| tag_flags(name))
        .ok_or_else(|| HarnessError::BadArgument {
            what: "debug token",
            value: name.to_string(),
        })
}

/// Applies `req` on top of `current`.
pub fn apply<'a>(current: Options<'a>, req: &'a EnvRequest) -> Result<EnvChange<'a>, HarnessError> {
    let mut opts = current;
    let mut changed = false;
    let mut clear = req.clear;
    let mut warnings = Vec::new();

    let mut debug = req.debug.map(DebugFlags::from_bits_truncate);
    if let Some(tag) = &req.tag {
        if debug.is_some() {
            warnings.push(format!("debug mask ignored, processing tag '{tag}'"));
        }
        debug = Some(flag_by_name(tag)?);
        if req.remove_with_tag && !req.keep {
            clear = true;
        }
    }
    if !req.plus.is_empty() || !req.minus.is_empty() {
        let mut flags = debug.unwrap_or_else(|| opts.flags_or_empty());
        for name in &req.plus {
            flags |= flag_by_name(name)?;
        }
        for name in &req.minus {
            flags.remove(flag_by_name(name)?);
        }
        debug = Some(flags);
    }
    if let Some(flags) = debug {
        opts.flags = Some(flags).filter(|f| !f.is_empty());
        changed = true;
    }
    if clear {
        changed = true;
    }

    match &req.address {
        Some(raw) => {
            let pair = format!("addr={raw}");
            opts.address = Options::parse(&pair)
                .map_err(|_| HarnessError::BadArgument {
                    what: "address",
                    value: raw.clone(),
                })?
                .address;
            changed = true;
        }
        None if clear => opts.address = None,
        None => {}
    }
    match req.interval {
        Some(n) => {
            opts.interval = Some(n).filter(|n| *n > 0);
            changed = true;
        }
        None if clear => opts.interval = None,
        None => {}
    }
    match req.lock_on {
        Some(n) => {
            opts.lock_on = Some(n).filter(|n| *n > 0);
            changed = true;
        }
        None if clear => opts.lock_on = None,
        None => {}
    }
    match &req.log {
        Some(path) => {
            opts.log_path = Some(path.as_str()).filter(|p| !p.is_empty());
            changed = true;
        }
        None if clear => opts.log_path = None,
        None => {}
    }
    if clear && debug.is_none() {
        opts.flags = None;
    }

    Ok(EnvChange {
        options: opts,
        changed,
        warnings,
    })
}

/// Human-readable dump of the current settings.
#[must_use]
pub fn describe(opts: &Options<'_>, verbose: bool) -> String {
    let mut out = String::new();
    match opts.flags {
        None => out.push_str("Debug-Flags  not-set\n"),
        Some(flags) => {
            let _ = writeln!(
                out,
                "Debug-Flags  {:#x} ({}) ({flags})",
                flags.bits(),
                flags.bits()
            );
            if verbose {
                for token in flags.tokens() {
                    let _ = writeln!(out, "   {} -- {}", token.name, token.description);
                }
            }
        }
    }
    match opts.address {
        None => out.push_str("Address      not-set\n"),
        Some(watch) => match watch.count {
            Some(count) => {
                let _ = writeln!(out, "Address      {:#x}, count = {count}", watch.addr);
            }
            None => {
                let _ = writeln!(out, "Address      {:#x}", watch.addr);
            }
        },
    }
    match opts.interval {
        None => out.push_str("Interval     not-set\n"),
        Some(n) => {
            let _ = writeln!(out, "Interval     {n}");
        }
    }
    match opts.lock_on {
        None => out.push_str("Lock-On      not-set\n"),
        Some(n) => {
            let _ = writeln!(out, "Lock-On      {n}");
        }
    }
    match opts.log_path {
        None => out.push_str("Logpath      not-set\n"),
        Some(path) => {
            let _ = writeln!(out, "Logpath      '{path}'");
        }
    }
    out
}

/// Token listing at three levels of detail.
#[must_use]
pub fn list_tokens(verbosity: u8) -> String {
    let mut out = String::from("Debug Tokens:\n");
    for token in TOKENS {
        let _ = match verbosity {
            0 => writeln!(out, "{}", token.name),
            1 => writeln!(out, "{} -- {}", token.name, token.description),
            _ => writeln!(
                out,
                "{} ({}) -- {} ({:#x})",
                token.name,
                token.short,
                token.description,
                token.flag.bits()
            ),
        };
    }
    out
}

/// Tag listing with the tokens each tag expands to.
#[must_use]
pub fn list_tags() -> String {
    let mut out = String::from("Tags:\n");
    for tag in TAGS {
        let _ = writeln!(out, "{} = {}", tag.name, tag.flags);
    }
    out
}

/// Renders the option string in `style`.
#[must_use]
pub fn render(opts: &Options<'_>, style: TokenStyle) -> String {
    opts.render(style).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_detection() {
        assert_eq!(Shell::detect(Some("/bin/bash")), Shell::Bourne);
        assert_eq!(Shell::detect(Some("zsh")), Shell::Bourne);
        assert_eq!(Shell::detect(Some("/bin/tcsh")), Shell::CShell);
        assert_eq!(Shell::detect(None), Shell::CShell);
    }

    #[test]
    fn export_code_per_shell() {
        assert_eq!(
            Shell::Bourne.export(OPTIONS_ENV, "debug=0x40"),
            "FENCEPOST_OPTIONS='debug=0x40';\nexport FENCEPOST_OPTIONS;\n"
        );
        assert_eq!(
            Shell::CShell.export(OPTIONS_ENV, "log=it's"),
            "setenv FENCEPOST_OPTIONS 'log=it'\\''s';\n"
        );
    }

    #[test]
    fn plus_and_minus_adjust_current_flags() {
        let current = Options::parse("check-fence,log-stats,inter=3").unwrap();
        let req = EnvRequest {
            plus: vec!["free-blank".into()],
            minus: vec!["lst".into()],
            ..EnvRequest::default()
        };
        let change = apply(current, &req).unwrap();
        assert!(change.changed);
        assert_eq!(
            change.options.flags,
            Some(DebugFlags::CHECK_FENCE | DebugFlags::FREE_BLANK)
        );
        assert_eq!(change.options.interval, Some(3));
    }

    #[test]
    fn tag_with_remove_clears_other_settings() {
        let current = Options::parse("debug=0x1,inter=3,log=old.log").unwrap();
        let req = EnvRequest {
            tag: Some("runtime".into()),
            debug: Some(0x40),
            remove_with_tag: true,
            ..EnvRequest::default()
        };
        let change = apply(current, &req).unwrap();
        assert_eq!(change.options.flags, tag_flags("runtime"));
        assert_eq!(change.options.interval, None);
        assert_eq!(change.options.log_path, None);
        assert_eq!(change.warnings.len(), 1);

        let keep = EnvRequest {
            keep: true,
            ..req.clone()
        };
        let kept = apply(current, &keep).unwrap();
        assert_eq!(kept.options.log_path, Some("old.log"));
    }

    #[test]
    fn zero_values_unset() {
        let current = Options::parse("debug=0x40,inter=9,lockon=2").unwrap();
        let req = EnvRequest {
            debug: Some(0),
            interval: Some(0),
            lock_on: Some(0),
            address: Some("0x5000:3".into()),
            ..EnvRequest::default()
        };
        let change = apply(current, &req).unwrap();
        assert_eq!(render(&change.options, TokenStyle::Hex), "addr=0x5000:3");
    }

    #[test]
    fn nothing_requested_is_unchanged() {
        let current = Options::parse("check-fence").unwrap();
        let req = EnvRequest::default();
        let change = apply(current, &req).unwrap();
        assert!(!change.changed);
        assert_eq!(change.options, current);
    }

    #[test]
    fn bad_token_and_address_are_rejected() {
        let req = EnvRequest {
            plus: vec!["no-such".into()],
            ..EnvRequest::default()
        };
        assert!(matches!(
            apply(Options::default(), &req),
            Err(HarnessError::BadArgument { what: "debug token", .. })
        ));
        let req = EnvRequest {
            address: Some("zz".into()),
            ..EnvRequest::default()
        };
        assert!(apply(Options::default(), &req).is_err());
    }

    #[test]
    fn describe_lists_every_setting() {
        let opts = Options::parse("check-fence,addr=0x10:2,log=x.log").unwrap();
        let text = describe(&opts, false);
        assert!(text.contains("Debug-Flags  0x40 (64) (check-fence)"));
        assert!(text.contains("Address      0x10, count = 2"));
        assert!(text.contains("Interval     not-set"));
        assert!(text.contains("Logpath      'x.log'"));
    }

    #[test]
    fn token_listing_levels() {
        assert!(list_tokens(0).contains("\ncheck-fence\n"));
        assert!(list_tokens(1).contains("check-fence -- check fence-post errors"));
        assert!(list_tokens(2).contains("check-fence (cfe) -- check fence-post errors (0x40)"));
        assert!(list_tags().contains("runtime = "));
    }
}
