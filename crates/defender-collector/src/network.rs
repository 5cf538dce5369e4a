use crate::ConnectionCollector;
use anyhow::{anyhow, Context, Result};
use defender_common::types::TcpConnection;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

/// Kernel socket state code for `TCP_ESTABLISHED`.
const TCP_ESTABLISHED: &str = "01";

/// Reads established TCP connections from the Linux procfs tables.
///
/// IPv4 rows (`/proc/net/tcp`) are listed before IPv6 rows
/// (`/proc/net/tcp6`), each in kernel table order. A missing table is
/// skipped, so hosts with IPv6 disabled still report their IPv4 sockets.
pub struct ProcNetCollector {
    tables: Vec<PathBuf>,
}

impl ProcNetCollector {
    pub fn new() -> Self {
        Self::with_tables(vec![
            PathBuf::from("/proc/net/tcp"),
            PathBuf::from("/proc/net/tcp6"),
        ])
    }

    pub fn with_tables(tables: Vec<PathBuf>) -> Self {
        Self { tables }
    }
}

impl Default for ProcNetCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCollector for ProcNetCollector {
    fn name(&self) -> &str {
        "procfs"
    }

    fn established_connections(&self) -> Result<Vec<TcpConnection>> {
        let mut connections = Vec::new();
        let mut read_any = false;

        for table in &self.tables {
            let content = match std::fs::read_to_string(table) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(table = %table.display(), "Socket table not present, skipping");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("reading {}", table.display()));
                }
            };
            read_any = true;
            connections.extend(parse_tcp_table(&content)?);
        }

        if !read_any {
            return Err(anyhow!("no TCP socket table could be read"));
        }
        Ok(connections)
    }
}

/// Parses the contents of a `/proc/net/tcp` or `/proc/net/tcp6` table and
/// returns the rows in the established state, in table order.
///
/// # Examples
///
/// ```
/// use defender_collector::network::parse_tcp_table;
///
/// let table = "  sl  local_address rem_address   st\n\
///    0: 0100007F:1F90 0100007F:C350 01 00000000:00000000\n\
///    1: 00000000:0016 00000000:0000 0A 00000000:00000000\n";
/// let conns = parse_tcp_table(table).unwrap();
/// assert_eq!(conns.len(), 1);
/// assert_eq!(conns[0].remote_addr.to_string(), "127.0.0.1:50000");
/// ```
pub fn parse_tcp_table(content: &str) -> Result<Vec<TcpConnection>> {
    let mut connections = Vec::new();

    // First line is the column header
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if fields[3] != TCP_ESTABLISHED {
            continue;
        }
        let local_addr = parse_socket_addr(fields[1])
            .with_context(|| format!("bad local address in row: {line}"))?;
        let remote_addr = parse_socket_addr(fields[2])
            .with_context(|| format!("bad remote address in row: {line}"))?;
        connections.push(TcpConnection::new(local_addr, remote_addr));
    }

    Ok(connections)
}

/// Decodes `ADDR:PORT` where `ADDR` is the kernel's hex dump of the address
/// in 32-bit host-order words and `PORT` is big-endian hex.
fn parse_socket_addr(field: &str) -> Result<SocketAddr> {
    let (addr, port) = field
        .split_once(':')
        .ok_or_else(|| anyhow!("missing ':' in {field}"))?;
    let port = u16::from_str_radix(port, 16)?;
    if !addr.is_ascii() {
        return Err(anyhow!("non-hex address in {field}"));
    }

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16)?;
            IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16)?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        n => return Err(anyhow!("unexpected address length {n} in {field}")),
    };

    Ok(SocketAddr::new(ip, port))
}
