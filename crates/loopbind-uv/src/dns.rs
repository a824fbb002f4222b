//! Name resolution on the pool

use std::any::Any;
use std::ffi::{CStr, CString};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use std::rc::Rc;

use crate::error::{Errno, UvResult};
use crate::event_loop::Loop;
use crate::request::{Done, ReqId, ReqType};

const NI_MAXHOST: usize = 1025;
const NI_MAXSERV: usize = 32;

/// Resolver hints; zero fields mean "any".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrInfoHints {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub flags: i32,
}

/// One resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub addr: IpAddr,
    pub port: u16,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub canonname: Option<String>,
}

/// Resolved host and service names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameInfo {
    pub host: String,
    pub service: String,
}

fn cstring(s: Option<&str>) -> UvResult<Option<CString>> {
    s.map(CString::new).transpose().map_err(|_| Errno::EINVAL)
}

/// Blocking `getaddrinfo`.
pub fn getaddrinfo(node: Option<&str>, service: Option<&str>, hints: Option<&AddrInfoHints>) -> UvResult<Vec<AddrInfo>> {
    if node.is_none() && service.is_none() {
        return Err(Errno::EINVAL);
    }
    let node = cstring(node)?;
    let service = cstring(service)?;

    // SAFETY: hints is zero-initialized and only read by getaddrinfo; the
    // result list is walked while valid and freed exactly once.
    unsafe {
        let mut raw_hints: libc::addrinfo = mem::zeroed();
        if let Some(h) = hints {
            raw_hints.ai_family = h.family;
            raw_hints.ai_socktype = h.socktype;
            raw_hints.ai_protocol = h.protocol;
            raw_hints.ai_flags = h.flags;
        }
        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let rc = libc::getaddrinfo(
            node.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            service.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            if hints.is_some() {
                &raw_hints as *const libc::addrinfo
            } else {
                ptr::null()
            },
            &mut res,
        );
        if rc != 0 {
            return Err(Errno::from_gai(rc));
        }

        let mut out = Vec::new();
        let mut cur = res;
        while !cur.is_null() {
            let ai = &*cur;
            if let Some((addr, port)) = decode_sockaddr(ai.ai_addr) {
                let canonname = if ai.ai_canonname.is_null() {
                    None
                } else {
                    Some(CStr::from_ptr(ai.ai_canonname).to_string_lossy().into_owned())
                };
                out.push(AddrInfo {
                    addr,
                    port,
                    family: ai.ai_family,
                    socktype: ai.ai_socktype,
                    protocol: ai.ai_protocol,
                    canonname,
                });
            }
            cur = ai.ai_next;
        }
        libc::freeaddrinfo(res);
        Ok(out)
    }
}

unsafe fn decode_sockaddr(sa: *const libc::sockaddr) -> Option<(IpAddr, u16)> {
    if sa.is_null() {
        return None;
    }
    match (*sa).sa_family as i32 {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some((IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some((IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

fn encode_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain data and large enough for either
    // address family.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }
}

/// Blocking `getnameinfo`.
pub fn getnameinfo(addr: &SocketAddr, flags: i32) -> UvResult<NameInfo> {
    let (storage, len) = encode_sockaddr(addr);
    let mut host = [0 as libc::c_char; NI_MAXHOST];
    let mut service = [0 as libc::c_char; NI_MAXSERV];
    // SAFETY: output buffers are sized as passed and NUL-terminated on success.
    unsafe {
        let rc = libc::getnameinfo(
            &storage as *const _ as *const libc::sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            service.as_mut_ptr(),
            service.len() as libc::socklen_t,
            flags,
        );
        if rc != 0 {
            return Err(Errno::from_gai(rc));
        }
        Ok(NameInfo {
            host: CStr::from_ptr(host.as_ptr()).to_string_lossy().into_owned(),
            service: CStr::from_ptr(service.as_ptr()).to_string_lossy().into_owned(),
        })
    }
}

/// Completion callback for address lookups.
pub type GetAddrInfoCb = fn(&Loop, Done<Vec<AddrInfo>>);
/// Completion callback for reverse lookups.
pub type GetNameInfoCb = fn(&Loop, Done<NameInfo>);

impl Loop {
    /// Resolve `node`/`service` on the pool.
    pub fn getaddrinfo(
        &self,
        node: Option<String>,
        service: Option<String>,
        hints: Option<AddrInfoHints>,
        data: Option<Rc<dyn Any>>,
        cb: GetAddrInfoCb,
    ) -> UvResult<ReqId> {
        if node.is_none() && service.is_none() {
            return Err(Errno::EINVAL);
        }
        self.submit(
            ReqType::GetAddrInfo,
            data,
            move || getaddrinfo(node.as_deref(), service.as_deref(), hints.as_ref()),
            cb,
        )
    }

    /// Reverse-resolve `addr` on the pool.
    pub fn getnameinfo(&self, addr: SocketAddr, flags: i32, data: Option<Rc<dyn Any>>, cb: GetNameInfoCb) -> UvResult<ReqId> {
        self.submit(ReqType::GetNameInfo, data, move || getnameinfo(&addr, flags), cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::RunMode;
    use std::cell::RefCell;

    #[test]
    fn test_numeric_host() {
        let hints = AddrInfoHints {
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            flags: libc::AI_NUMERICHOST | libc::AI_NUMERICSERV,
            ..Default::default()
        };
        let res = getaddrinfo(Some("127.0.0.1"), Some("8080"), Some(&hints)).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(res[0].port, 8080);
        assert_eq!(res[0].family, libc::AF_INET);
    }

    #[test]
    fn test_requires_node_or_service() {
        assert_eq!(getaddrinfo(None, None, None), Err(Errno::EINVAL));
    }

    #[test]
    fn test_numeric_reverse_lookup() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let info = getnameinfo(&addr, libc::NI_NUMERICHOST | libc::NI_NUMERICSERV).unwrap();
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.service, "80");
    }

    thread_local! {
        static FOUND: RefCell<Option<UvResult<Vec<AddrInfo>>>> = RefCell::new(None);
    }

    fn on_resolved(_lp: &Loop, done: Done<Vec<AddrInfo>>) {
        FOUND.with(|f| *f.borrow_mut() = Some(done.result));
    }

    #[test]
    fn test_async_lookup() {
        let lp = Loop::with_pool_size(1);
        let hints = AddrInfoHints {
            flags: libc::AI_NUMERICHOST,
            ..Default::default()
        };
        lp.getaddrinfo(Some("::1".to_string()), None, Some(hints), None, on_resolved)
            .unwrap();
        lp.run(RunMode::Default);
        FOUND.with(|f| {
            let found = f.borrow_mut().take().unwrap().unwrap();
            assert!(found.iter().all(|a| a.addr == IpAddr::V6(Ipv6Addr::LOCALHOST)));
        });
    }
}
