//! jls(8) output

/// Parse `jls -j NAME param` (a single value)
pub fn parse_param(output: &str) -> Option<String> {
    let value = output.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse `jls name jid` rows into (name, jid)
pub fn parse_running(output: &str) -> Vec<(String, i32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let name = words.next()?;
            let jid = words.next()?.parse().ok()?;
            Some((name.to_string(), jid))
        })
        .collect()
}

/// Parse `sysctl -N security.jail.param` into parameter names
///
/// `security.jail.param.allow.raw_sockets` becomes `allow.raw_sockets`;
/// the intermediate nodes (`allow.`) are dropped.
pub fn parse_jail_params(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().trim_end_matches(':').strip_prefix("security.jail.param."))
        .filter(|name| !name.is_empty() && !name.ends_with('.'))
        .map(str::to_string)
        .collect()
}
