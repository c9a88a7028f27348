use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

/// Flag-style arguments following a subcommand.
pub struct Args {
    args: Vec<String>,
}

impl Args {
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    pub fn value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(|s| s.as_str())
    }

    pub fn required(&self, flag: &str) -> Result<&str> {
        self.value(flag).ok_or_else(|| anyhow!("missing required {}", flag))
    }

    pub fn parsed<T>(&self, flag: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.value(flag)
            .map(|v| v.parse().with_context(|| format!("Invalid value for {}: {}", flag, v)))
            .transpose()
    }

    /// First argument that is neither a flag nor a flag's value.
    pub fn positional(&self) -> Option<&str> {
        let mut skip = false;
        for arg in &self.args {
            if skip {
                skip = false;
                continue;
            }
            if arg.starts_with("--") {
                skip = true;
                continue;
            }
            return Some(arg);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Args {
        Args::new(list.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_flag_values() {
        let a = args(&["--pair", "BTC/USDT", "--from", "100"]);
        assert_eq!(a.value("--pair"), Some("BTC/USDT"));
        assert_eq!(a.parsed::<i64>("--from").unwrap(), Some(100));
        assert_eq!(a.parsed::<i64>("--to").unwrap(), None);
        assert!(a.required("--timeframe").is_err());
    }

    #[test]
    fn test_bad_number_rejected() {
        let a = args(&["--ts", "soon"]);
        assert!(a.parsed::<i64>("--ts").is_err());
    }

    #[test]
    fn test_positional_skips_flags() {
        assert_eq!(args(&["--run", "r1", "queries.ndjson"]).positional(), Some("queries.ndjson"));
        assert_eq!(args(&["queries.ndjson", "--run", "r1"]).positional(), Some("queries.ndjson"));
        assert_eq!(args(&["--run", "r1"]).positional(), None);
    }
}
