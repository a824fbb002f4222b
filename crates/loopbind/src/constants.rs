//! Named constants and the string/number conversions bound functions use
//! for signals, address families, socket types and protocols.

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{fs, Errno};

use crate::bridge::Bridge;

// ============================================================================
// Name tables
// ============================================================================

const SIGNALS: &[(&str, i32)] = &[
    ("SIGHUP", libc::SIGHUP),
    ("SIGINT", libc::SIGINT),
    ("SIGQUIT", libc::SIGQUIT),
    ("SIGILL", libc::SIGILL),
    ("SIGTRAP", libc::SIGTRAP),
    ("SIGABRT", libc::SIGABRT),
    ("SIGBUS", libc::SIGBUS),
    ("SIGFPE", libc::SIGFPE),
    ("SIGKILL", libc::SIGKILL),
    ("SIGUSR1", libc::SIGUSR1),
    ("SIGSEGV", libc::SIGSEGV),
    ("SIGUSR2", libc::SIGUSR2),
    ("SIGPIPE", libc::SIGPIPE),
    ("SIGALRM", libc::SIGALRM),
    ("SIGTERM", libc::SIGTERM),
    ("SIGCHLD", libc::SIGCHLD),
    ("SIGCONT", libc::SIGCONT),
    ("SIGSTOP", libc::SIGSTOP),
    ("SIGTSTP", libc::SIGTSTP),
    ("SIGTTIN", libc::SIGTTIN),
    ("SIGTTOU", libc::SIGTTOU),
    ("SIGURG", libc::SIGURG),
    ("SIGXCPU", libc::SIGXCPU),
    ("SIGXFSZ", libc::SIGXFSZ),
    ("SIGVTALRM", libc::SIGVTALRM),
    ("SIGPROF", libc::SIGPROF),
    ("SIGWINCH", libc::SIGWINCH),
    ("SIGIO", libc::SIGIO),
    ("SIGSYS", libc::SIGSYS),
];

const FAMILIES: &[(&str, i32)] = &[
    ("AF_UNIX", libc::AF_UNIX),
    ("AF_INET", libc::AF_INET),
    ("AF_INET6", libc::AF_INET6),
    ("AF_UNSPEC", libc::AF_UNSPEC),
];

const SOCKTYPES: &[(&str, i32)] = &[
    ("SOCK_STREAM", libc::SOCK_STREAM),
    ("SOCK_DGRAM", libc::SOCK_DGRAM),
    ("SOCK_SEQPACKET", libc::SOCK_SEQPACKET),
    ("SOCK_RAW", libc::SOCK_RAW),
    ("SOCK_RDM", libc::SOCK_RDM),
];

// IANA numbers, stable across platforms.
const PROTOCOLS: &[(&str, i32)] = &[
    ("ip", 0),
    ("icmp", 1),
    ("igmp", 2),
    ("tcp", 6),
    ("udp", 17),
    ("ipv6", 41),
    ("icmpv6", 58),
    ("sctp", 132),
    ("raw", 255),
];

const FILE_FLAGS: &[(&str, i32)] = &[
    ("O_RDONLY", libc::O_RDONLY),
    ("O_WRONLY", libc::O_WRONLY),
    ("O_RDWR", libc::O_RDWR),
    ("O_APPEND", libc::O_APPEND),
    ("O_CREAT", libc::O_CREAT),
    ("O_DSYNC", libc::O_DSYNC),
    ("O_EXCL", libc::O_EXCL),
    ("O_NOCTTY", libc::O_NOCTTY),
    ("O_NONBLOCK", libc::O_NONBLOCK),
    ("O_SYNC", libc::O_SYNC),
    ("O_TRUNC", libc::O_TRUNC),
    ("O_DIRECTORY", libc::O_DIRECTORY),
    ("O_NOFOLLOW", libc::O_NOFOLLOW),
];

const MODE_BITS: &[(&str, u32)] = &[
    ("S_IFMT", libc::S_IFMT as u32),
    ("S_IFREG", libc::S_IFREG as u32),
    ("S_IFDIR", libc::S_IFDIR as u32),
    ("S_IFIFO", libc::S_IFIFO as u32),
    ("S_IFCHR", libc::S_IFCHR as u32),
    ("S_IFBLK", libc::S_IFBLK as u32),
    ("S_IFLNK", libc::S_IFLNK as u32),
    ("S_IFSOCK", libc::S_IFSOCK as u32),
];

const ACCESS_MODES: &[(&str, i32)] = &[
    ("F_OK", libc::F_OK),
    ("R_OK", libc::R_OK),
    ("W_OK", libc::W_OK),
    ("X_OK", libc::X_OK),
];

const AI_FLAGS: &[(&str, i32)] = &[
    ("AI_ADDRCONFIG", libc::AI_ADDRCONFIG),
    ("AI_V4MAPPED", libc::AI_V4MAPPED),
    ("AI_ALL", libc::AI_ALL),
    ("AI_NUMERICHOST", libc::AI_NUMERICHOST),
    ("AI_PASSIVE", libc::AI_PASSIVE),
    ("AI_NUMERICSERV", libc::AI_NUMERICSERV),
    ("AI_CANONNAME", libc::AI_CANONNAME),
];

const NI_FLAGS: &[(&str, i32)] = &[
    ("NI_NAMEREQD", libc::NI_NAMEREQD),
    ("NI_DGRAM", libc::NI_DGRAM),
    ("NI_NOFQDN", libc::NI_NOFQDN),
    ("NI_NUMERICHOST", libc::NI_NUMERICHOST),
    ("NI_NUMERICSERV", libc::NI_NUMERICSERV),
];

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> &'a str {
    match name.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &name[prefix.len()..],
        _ => name,
    }
}

/// Case-insensitive lookup with the table's prefix optional.
fn lookup(table: &[(&str, i32)], prefix: &str, name: &str) -> Option<i32> {
    let bare = strip_prefix_ignore_case(name, prefix);
    table
        .iter()
        .find(|(full, _)| full[prefix.len()..].eq_ignore_ascii_case(bare))
        .map(|&(_, n)| n)
}

fn reverse(table: &[(&'static str, i32)], n: i32) -> Option<&'static str> {
    table.iter().find(|&&(_, v)| v == n).map(|&(name, _)| name)
}

// ============================================================================
// Conversions
// ============================================================================

/// `"SIGINT"`, `"sigint"` and `"int"` all name the same signal.
pub fn signal_str2int(name: &str) -> Option<i32> {
    lookup(SIGNALS, "SIG", name)
}

pub fn signal_int2str(signum: i32) -> Option<&'static str> {
    reverse(SIGNALS, signum)
}

/// Address family by name (`"inet"`, `"AF_INET6"`, ...).
pub fn af_str2int(name: &str) -> Option<i32> {
    lookup(FAMILIES, "AF_", name)
}

pub fn af_int2str(family: i32) -> Option<&'static str> {
    reverse(FAMILIES, family)
}

/// Socket type by name (`"stream"`, `"SOCK_DGRAM"`, ...).
pub fn sock_str2int(name: &str) -> Option<i32> {
    lookup(SOCKTYPES, "SOCK_", name)
}

pub fn sock_int2str(socktype: i32) -> Option<&'static str> {
    reverse(SOCKTYPES, socktype)
}

pub fn protocol_str2int(name: &str) -> Option<i32> {
    lookup(PROTOCOLS, "", name)
}

pub fn protocol_int2str(protocol: i32) -> Option<&'static str> {
    reverse(PROTOCOLS, protocol)
}

// ============================================================================
// Table
// ============================================================================

/// Every named constant as one flat table.
pub fn table() -> Value {
    let mut entries: Vec<(String, Value)> = Vec::new();
    let mut push = |name: &str, n: i64| entries.push((name.to_string(), Value::Integer(n)));

    for list in [FILE_FLAGS, ACCESS_MODES, FAMILIES, SOCKTYPES, AI_FLAGS, NI_FLAGS, SIGNALS] {
        for &(name, n) in list {
            push(name, n as i64);
        }
    }
    for &(name, n) in MODE_BITS {
        push(name, n as i64);
    }
    for &(name, n) in PROTOCOLS {
        push(format!("IPPROTO_{}", name.to_ascii_uppercase()).as_str(), n as i64);
    }
    push("UV_FS_COPYFILE_EXCL", fs::COPYFILE_EXCL as i64);
    push("UV_FS_COPYFILE_FICLONE", fs::COPYFILE_FICLONE as i64);
    push("UV_FS_COPYFILE_FICLONE_FORCE", fs::COPYFILE_FICLONE_FORCE as i64);
    push("UV_FS_SYMLINK_DIR", fs::SYMLINK_DIR as i64);
    push("UV_FS_SYMLINK_JUNCTION", fs::SYMLINK_JUNCTION as i64);
    for err in Errno::all() {
        push(err.name().as_ref(), err.code() as i64);
    }
    Value::Table(entries)
}

/// `constants()`
pub fn constants(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![bridge.constants()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_str2int("SIGINT"), Some(libc::SIGINT));
        assert_eq!(signal_str2int("sigint"), Some(libc::SIGINT));
        assert_eq!(signal_str2int("term"), Some(libc::SIGTERM));
        assert_eq!(signal_str2int("SIGNOPE"), None);
        assert_eq!(signal_int2str(libc::SIGHUP), Some("SIGHUP"));
        assert_eq!(signal_int2str(0), None);
    }

    #[test]
    fn test_families_and_socktypes() {
        assert_eq!(af_str2int("inet"), Some(libc::AF_INET));
        assert_eq!(af_str2int("AF_INET6"), Some(libc::AF_INET6));
        assert_eq!(af_str2int("appletalk"), None);
        assert_eq!(af_int2str(libc::AF_INET), Some("AF_INET"));
        assert_eq!(sock_str2int("stream"), Some(libc::SOCK_STREAM));
        assert_eq!(sock_int2str(libc::SOCK_DGRAM), Some("SOCK_DGRAM"));
        assert_eq!(protocol_str2int("TCP"), Some(6));
        assert_eq!(protocol_int2str(17), Some("udp"));
    }

    #[test]
    fn test_table_contents() {
        let table = table();
        assert_eq!(table.get("O_CREAT"), Some(&Value::Integer(libc::O_CREAT as i64)));
        assert_eq!(table.get("SIGINT"), Some(&Value::Integer(libc::SIGINT as i64)));
        assert_eq!(table.get("IPPROTO_TCP"), Some(&Value::Integer(6)));
        assert_eq!(table.get("ENOENT"), Some(&Value::Integer(Errno::ENOENT.code() as i64)));
    }
}
