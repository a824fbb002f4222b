//! Name resolution
//!
//! Both lookups run on the calling thread when no callback is given.
//! Callbacks receive the error name, or `nil` followed by the results.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{dns, AddrInfo, AddrInfoHints, Done, Loop, NameInfo, ReqType};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::constants;
use crate::request;
use crate::result;

const HINT_FLAGS: &[(&str, i32)] = &[
    ("addrconfig", libc::AI_ADDRCONFIG),
    ("v4mapped", libc::AI_V4MAPPED),
    ("all", libc::AI_ALL),
    ("numerichost", libc::AI_NUMERICHOST),
    ("passive", libc::AI_PASSIVE),
    ("numericserv", libc::AI_NUMERICSERV),
    ("canonname", libc::AI_CANONNAME),
];

fn check_hints(args: &Args<'_>, index: usize) -> AbiResult<Option<AddrInfoHints>> {
    let Some(table) = args.opt_table(index)? else {
        return Ok(None);
    };
    let mut hints = AddrInfoHints::default();

    hints.family = match table.get("family") {
        None | Some(Value::Nil) => libc::AF_UNSPEC,
        Some(Value::String(_)) => table
            .get("family")
            .and_then(Value::as_str)
            .and_then(constants::af_str2int)
            .unwrap_or(libc::AF_UNSPEC),
        Some(v) => v
            .as_integer()
            .ok_or_else(|| args.error(index, "family hint must be string if set"))? as i32,
    };

    hints.socktype = match table.get("socktype") {
        None | Some(Value::Nil) => 0,
        Some(v @ Value::String(_)) => {
            let name = v.as_str().unwrap_or_default();
            constants::sock_str2int(name)
                .ok_or_else(|| args.error(index, format!("invalid socktype: {}", name)))?
        }
        Some(v) => v
            .as_integer()
            .ok_or_else(|| args.error(index, "socktype hint must be string if set"))? as i32,
    };

    hints.protocol = match table.get("protocol") {
        None | Some(Value::Nil) => 0,
        Some(v @ Value::String(_)) => {
            let name = v.as_str().unwrap_or_default();
            constants::protocol_str2int(name)
                .ok_or_else(|| args.error(index, format!("invalid protocol: {}", name)))?
        }
        Some(v) => v
            .as_integer()
            .ok_or_else(|| args.error(index, "protocol hint must be string if set"))? as i32,
    };

    for &(name, bit) in HINT_FLAGS {
        if table.get(name).is_some_and(Value::truthy) {
            hints.flags |= bit;
        }
    }
    Ok(Some(hints))
}

fn addrinfo_table(info: &AddrInfo) -> Value {
    let mut entry = vec![("addr".to_string(), Value::from(info.addr.to_string()))];
    if info.port != 0 {
        entry.push(("port".to_string(), Value::Integer(info.port as i64)));
    }
    if let Some(family) = constants::af_int2str(info.family) {
        entry.push(("family".to_string(), Value::from(family)));
    }
    if let Some(socktype) = constants::sock_int2str(info.socktype) {
        entry.push(("socktype".to_string(), Value::from(socktype)));
    }
    if let Some(protocol) = constants::protocol_int2str(info.protocol) {
        entry.push(("protocol".to_string(), Value::from(protocol)));
    }
    if let Some(canonname) = &info.canonname {
        entry.push(("canonname".to_string(), Value::from(canonname.as_str())));
    }
    Value::Table(entry)
}

fn addrinfo_list(infos: &[AddrInfo]) -> Value {
    Value::List(infos.iter().map(addrinfo_table).collect())
}

fn getaddrinfo_cb(lp: &Loop, done: Done<Vec<AddrInfo>>) {
    request::complete(lp, done, |_, _, result| match result {
        Ok(infos) => vec![Value::Nil, addrinfo_list(&infos)],
        Err(err) => vec![Value::from(err.name().into_owned())],
    });
}

fn getnameinfo_cb(lp: &Loop, done: Done<NameInfo>) {
    request::complete(lp, done, |_, _, result| match result {
        Ok(info) => vec![Value::Nil, Value::from(info.host), Value::from(info.service)],
        Err(err) => vec![Value::from(err.name().into_owned())],
    });
}

/// `getaddrinfo(host, service, [hints], [callback])`
pub fn getaddrinfo(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let node = args.opt_string(1)?;
    let service = args.opt_string(2)?;
    let hints = check_hints(&args, 3)?;

    let Some(callback) = args.opt_callable(4)? else {
        return Ok(match dns::getaddrinfo(node.as_deref(), service.as_deref(), hints.as_ref()) {
            Ok(infos) => vec![addrinfo_list(&infos)],
            Err(err) => result::fail(err),
        });
    };

    let (wrapper, value) = request::new_request(bridge, ReqType::GetAddrInfo, Some(callback), &[])?;
    match bridge
        .native()
        .getaddrinfo(node, service, hints, request::data_of(&wrapper), getaddrinfo_cb)
    {
        Ok(req) => {
            wrapper.submitted(req);
            Ok(vec![value])
        }
        Err(err) => {
            wrapper.discard(args.ctx());
            Ok(result::fail(err))
        }
    }
}

fn check_sockaddr(args: &Args<'_>, index: usize) -> AbiResult<SocketAddr> {
    let table = args.table(index)?;
    let family = match table.get("family") {
        Some(Value::String(_)) => table
            .get("family")
            .and_then(Value::as_str)
            .and_then(constants::af_str2int)
            .unwrap_or(libc::AF_UNSPEC),
        Some(v) => v.as_integer().unwrap_or(libc::AF_UNSPEC as i64) as i32,
        None => libc::AF_UNSPEC,
    };
    let ip = match table.get("ip") {
        None | Some(Value::Nil) => None,
        Some(v @ Value::String(_)) => v.as_str().map(str::to_string),
        Some(_) => return Err(args.error(index, "string or nil expected in 'ip' field")),
    };
    let port = match table.get("port") {
        None | Some(Value::Nil) => 0,
        Some(v) => v
            .as_integer()
            .filter(|p| (0..=u16::MAX as i64).contains(p))
            .ok_or_else(|| args.error(index, "invalid ip address or port"))? as u16,
    };

    let addr = match (ip, family) {
        (None, f) if f == libc::AF_INET6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        (None, _) => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        (Some(ip), f) if f == libc::AF_INET6 => ip.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
        (Some(ip), f) if f == libc::AF_INET => ip.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
        (Some(ip), _) => ip.parse::<IpAddr>().ok(),
    };
    addr.map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| args.error(index, "invalid ip address or port"))
}

/// `getnameinfo({ip, port, family}, [callback])`
pub fn getnameinfo(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let addr = check_sockaddr(&args, 1)?;

    let Some(callback) = args.opt_callable(2)? else {
        return Ok(match dns::getnameinfo(&addr, 0) {
            Ok(info) => vec![Value::from(info.host), Value::from(info.service)],
            Err(err) => result::fail(err),
        });
    };

    let (wrapper, value) = request::new_request(bridge, ReqType::GetNameInfo, Some(callback), &[])?;
    match bridge
        .native()
        .getnameinfo(addr, 0, request::data_of(&wrapper), getnameinfo_cb)
    {
        Ok(req) => {
            wrapper.submitted(req);
            Ok(vec![value])
        }
        Err(err) => {
            wrapper.discard(args.ctx());
            Ok(result::fail(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn numeric_hints() -> Value {
        Value::Table(vec![
            ("family".to_string(), Value::from("inet")),
            ("socktype".to_string(), Value::from("stream")),
            ("numerichost".to_string(), Value::Boolean(true)),
            ("numericserv".to_string(), Value::Boolean(true)),
        ])
    }

    #[test]
    fn test_sync_numeric_lookup() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let out = bridge
            .call("getaddrinfo", &[Value::from("127.0.0.1"), Value::from("80"), numeric_hints()])
            .unwrap();
        let Value::List(entries) = &out[0] else {
            panic!("expected a list, got {:?}", out);
        };
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.get("addr"), Some(&Value::from("127.0.0.1")));
        assert_eq!(entry.get("port"), Some(&Value::Integer(80)));
        assert_eq!(entry.get("family"), Some(&Value::from("AF_INET")));
        assert_eq!(entry.get("socktype"), Some(&Value::from("SOCK_STREAM")));
    }

    #[test]
    fn test_async_lookup_reaches_callback() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let cb = {
            let seen = seen.clone();
            rt.function(move |_, args| {
                seen.borrow_mut().push(args);
                Ok(vec![])
            })
        };
        let req = bridge
            .call("getaddrinfo", &[Value::from("127.0.0.1"), Value::Nil, numeric_hints(), cb])
            .unwrap()
            .remove(0);
        assert_eq!(rt.type_name(&req), "uv_req");
        bridge.call("run", &[]).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], Value::Nil);
        assert!(matches!(&seen[0][1], Value::List(list) if !list.is_empty()));
        assert_eq!(rt.live_refs(), 0);
    }

    #[test]
    fn test_bad_hints_raise() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let hints = Value::Table(vec![("protocol".to_string(), Value::from("carrier-pigeon"))]);
        let err = bridge
            .call("getaddrinfo", &[Value::from("localhost"), Value::Nil, hints])
            .unwrap_err();
        assert_eq!(err.to_string(), "bad argument #3 (invalid protocol: carrier-pigeon)");
    }

    #[test]
    fn test_nothing_to_resolve_fails() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let out = bridge.call("getaddrinfo", &[]).unwrap();
        assert_eq!(out[2], Value::from("EINVAL"));
    }

    #[test]
    fn test_getnameinfo_rejects_bad_ip() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let addr = Value::Table(vec![("ip".to_string(), Value::from("300.1.1.1"))]);
        let err = bridge.call("getnameinfo", &[addr]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (invalid ip address or port)");
        let addr = Value::Table(vec![("ip".to_string(), Value::Boolean(true))]);
        let err = bridge.call("getnameinfo", &[addr]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (string or nil expected in 'ip' field)");
    }
}
