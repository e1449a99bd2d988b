#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate nix;
extern crate limits;

use std::ffi::CString;

use error_chain::ChainedError;

use limits::ResourceKind;


error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Limits(::limits::Error, ::limits::ErrorKind);
    }

    foreign_links {
        Nix(::nix::Error);
    }
}


/// Parse a limit value the way `strtoul(value, NULL, 0)` would: `0x` prefixed values are
/// hexadecimal, other values with a leading zero are octal, everything else is decimal.
fn parse_value(text: &str) -> Result<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8)
    } else {
        text.parse::<u64>()
    };

    parsed.chain_err(|| Error::from(format!("invalid limit value: {}", text)))
}

/// Apply one limit, setting both the soft and the hard value.
fn apply_limit(kind: ResourceKind, value: u64) -> Result<()> {
    let native = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };

    let ret = unsafe { libc::setrlimit(kind as u32, &native) };
    if ret != 0 {
        bail!("setrlimit for {} failed: {}", kind.name(), std::io::Error::last_os_error());
    }

    Ok(())
}

fn do_main() -> Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();

    // Leading arguments come in NAME VALUE pairs; the first token that is not a limit name
    // starts the command.
    let mut index = 0;
    while index + 1 < args.len() {
        let kind = match ResourceKind::parse(&args[index]) {
            Ok(kind) => kind,
            Err(..) => break
        };

        apply_limit(kind, parse_value(&args[index + 1])?)?;
        index += 2;
    }

    if args.get(index).map(|arg| arg == "--").unwrap_or(false) {
        index += 1;
    }

    let command = &args[index..];
    if command.is_empty() {
        bail!("no command given after the limit pairs");
    }

    let native_argv = command.iter()
        .map(|arg| CString::new(arg.clone()))
        .collect::<std::result::Result<Vec<CString>, _>>()
        .chain_err(|| Error::from("command contains a NUL byte"))
        ?;

    nix::unistd::execvp(&native_argv[0], &native_argv)?;

    unreachable!()
}

fn main() -> Result<()> {
    match do_main() {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e.display_chain().to_string());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_bases() {
        assert_eq!(0x1000, parse_value("0x1000").unwrap());
        assert_eq!(0x1000, parse_value("0X1000").unwrap());
        assert_eq!(8, parse_value("010").unwrap());
        assert_eq!(42, parse_value("42").unwrap());
        assert_eq!(0, parse_value("0").unwrap());
        assert!(parse_value("banana").is_err());
    }
}
