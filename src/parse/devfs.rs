//! devfs(8) rule output

use crate::error::{Error, Result};

/// Parse `devfs rule showsets` (one ruleset number per line)
pub fn parse_showsets(output: &str) -> Result<Vec<u32>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.parse()
                .map_err(|_| Error::InvalidConfiguration(format!("bad devfs ruleset '{}'", l)))
        })
        .collect()
}

/// Parse `devfs rule -s N show` into rule bodies without their numbers
///
/// `100 path 'bpf*' unhide` becomes `path 'bpf*' unhide`, ready to be
/// re-added to another ruleset with `devfs rule -s M add ...`. A leading
/// `add` verb is tolerated.
pub fn parse_rules(output: &str) -> Result<Vec<String>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (number, body) = line.split_once(' ').unwrap_or((line, ""));
            let body = body.trim();
            let body = body.strip_prefix("add ").unwrap_or(body).trim();
            if number.parse::<u32>().is_err() || body.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "unexpected devfs rule line '{}'",
                    line
                )));
            }
            Ok(body.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_showsets() {
        assert_eq!(parse_showsets("1\n2\n3\n4\n5\n").unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(parse_showsets("x\n").is_err());
    }

    #[test]
    fn test_rules() {
        let out = "100 add hide\n200 add path log unhide\n300 add path 'bpf*' unhide\n";
        let rules = parse_rules(out).unwrap();
        assert_eq!(rules, vec!["hide", "path log unhide", "path 'bpf*' unhide"]);
        assert!(parse_rules("include 1\n").is_err());
        assert!(parse_rules("100\n").is_err());

        let rules = parse_rules("100 include 1\n200 include 2\n300 path fuse unhide\n").unwrap();
        assert_eq!(rules, vec!["include 1", "include 2", "path fuse unhide"]);
    }
}
