//! route(8) output

use std::net::IpAddr;

/// Default route as reported by `route -n get default`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<IpAddr>,
    pub interface: String,
}

/// Parse `route -n get default`; None when there is no default route
pub fn parse_default_route(output: &str) -> Option<DefaultRoute> {
    let mut gateway = None;
    let mut interface = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key.trim() {
            "gateway" => gateway = value.trim().parse().ok(),
            "interface" => interface = Some(value.trim().to_string()),
            _ => {}
        }
    }

    interface.map(|interface| DefaultRoute { gateway, interface })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_route() {
        let out = "   route to: default
destination: default
       mask: default
    gateway: 192.168.1.1
        fib: 0
  interface: em0
      flags: <UP,GATEWAY,DONE,STATIC>
";
        let route = parse_default_route(out).unwrap();
        assert_eq!(route.interface, "em0");
        assert_eq!(route.gateway.unwrap().to_string(), "192.168.1.1");
    }

    #[test]
    fn test_no_default_route() {
        assert!(parse_default_route("route: route has not been found\n").is_none());
    }
}
