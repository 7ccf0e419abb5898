use chrono::TimeZone;
use nom::branch::alt;
use nom::bytes::complete::tag_no_case;
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{preceded, tuple};
use nom_supreme::ParserExt;

use crate::common::parser::{consume_all, p_integer_string, NomResult};

enum MemUnit {
    Megabytes,
    Gigabytes,
}

fn p_mem_unit(input: &str) -> NomResult<MemUnit> {
    alt((
        map(alt((tag_no_case("gb"), tag_no_case("g"))), |_| {
            MemUnit::Gigabytes
        }),
        map(alt((tag_no_case("mb"), tag_no_case("m"))), |_| {
            MemUnit::Megabytes
        }),
    ))(input)
}

fn p_decimal(input: &str) -> NomResult<f64> {
    map(
        tuple((p_integer_string, opt(preceded(char('.'), p_integer_string)))),
        |(whole, frac)| {
            let mut text = whole;
            if let Some(frac) = frac {
                text.push('.');
                text.push_str(&frac);
            }
            text.parse::<f64>().unwrap_or(0.0)
        },
    )(input)
}

fn p_mem_mb(input: &str) -> NomResult<u64> {
    map(
        tuple((p_decimal, opt(p_mem_unit))).context("memory size (e.g. 8GB, 1024MB, 512)"),
        |(value, unit)| match unit {
            Some(MemUnit::Gigabytes) => (value * 1024.0) as u64,
            Some(MemUnit::Megabytes) | None => value as u64,
        },
    )(input)
}

/// Parses a memory size into megabytes.
///
/// Accepts a bare number (megabytes), `M`/`MB` and `G`/`GB` suffixes,
/// case-insensitive, with an integer or float mantissa. 1 GB = 1024 MB.
pub fn parse_mem_mb(input: &str) -> anyhow::Result<u64> {
    consume_all(p_mem_mb, input.trim())
}

crate::arg_wrapper!(ArgMemory, u64, parse_mem_mb);

pub fn human_mem_mb(mem_mb: u64) -> String {
    if mem_mb < 2048 {
        format!("{} MB", mem_mb)
    } else {
        format!("{:.1} GB", mem_mb as f64 / 1024.0)
    }
}

/// Formats an epoch timestamp for table output, `-` when unset.
pub fn format_ts(ts: Option<f64>) -> String {
    match ts {
        Some(ts) => {
            let secs = ts as i64;
            let nanos = ((ts - secs as f64) * 1e9) as u32;
            match chrono::Local.timestamp_opt(secs, nanos).single() {
                Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
                None => "-".to_string(),
            }
        }
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{human_mem_mb, parse_mem_mb};

    #[test]
    fn test_parse_mem_plain() {
        assert_eq!(parse_mem_mb("256").unwrap(), 256);
        assert_eq!(parse_mem_mb("1").unwrap(), 1);
    }

    #[test]
    fn test_parse_mem_megabytes() {
        assert_eq!(parse_mem_mb("1024MB").unwrap(), 1024);
        assert_eq!(parse_mem_mb("512m").unwrap(), 512);
        assert_eq!(parse_mem_mb("512M").unwrap(), 512);
    }

    #[test]
    fn test_parse_mem_gigabytes() {
        assert_eq!(parse_mem_mb("8GB").unwrap(), 8192);
        assert_eq!(parse_mem_mb("2g").unwrap(), 2048);
        assert_eq!(parse_mem_mb("1.5G").unwrap(), 1536);
        assert_eq!(parse_mem_mb("1.5gb").unwrap(), 1536);
    }

    #[test]
    fn test_parse_mem_float_mantissa() {
        assert_eq!(parse_mem_mb("0.5GB").unwrap(), 512);
        assert_eq!(parse_mem_mb("1.9").unwrap(), 1);
    }

    #[test]
    fn test_parse_mem_whitespace() {
        assert_eq!(parse_mem_mb(" 4GB ").unwrap(), 4096);
    }

    #[test]
    fn test_parse_mem_invalid() {
        assert!(parse_mem_mb("").is_err());
        assert!(parse_mem_mb("abc").is_err());
        assert!(parse_mem_mb("12X").is_err());
        assert!(parse_mem_mb("GB").is_err());
    }

    #[test]
    fn test_human_mem() {
        assert_eq!(human_mem_mb(512).as_str(), "512 MB");
        assert_eq!(human_mem_mb(8192).as_str(), "8.0 GB");
    }
}
