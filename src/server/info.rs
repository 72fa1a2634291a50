//! INFO sections.
//!
//! Sections are dumped in registration order. Each one starts with a
//! `# Name` header and consists of `key:value` lines.

use super::Service;
use std::fmt::Write;
use tracing::warn;

pub type DumpFn = fn(&Service, &mut String);

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Ordered name to dump function table.
pub struct InfoRegistry {
    sections: Vec<(&'static str, DumpFn)>,
}

impl Default for InfoRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("server", dump_server);
        registry.register("clients", dump_clients);
        registry.register("memory", dump_memory);
        registry.register("keyspace", dump_keyspace);
        registry
    }
}

impl InfoRegistry {
    /// An empty registry; `default()` has the built-in sections.
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
        }
    }

    /// Re-registering a name replaces its dump function in place.
    pub fn register(&mut self, name: &'static str, f: DumpFn) {
        match self.sections.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = f,
            None => self.sections.push((name, f)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sections.iter().map(|(n, _)| *n)
    }

    /// One section, or every section separated by a blank line when `name`
    /// is empty. An unknown section yields just its header.
    pub fn dump(&self, service: &Service, name: &str) -> String {
        let mut out = String::new();
        if name.is_empty() {
            for (i, (name, f)) in self.sections.iter().enumerate() {
                if i > 0 {
                    out.push_str("\r\n");
                }
                header(&mut out, name);
                f(service, &mut out);
            }
            return out;
        }

        let name = name.to_ascii_lowercase();
        header(&mut out, &name);
        if let Some((_, f)) = self.sections.iter().find(|(n, _)| *n == name) {
            f(service, &mut out);
        }
        out
    }
}

fn header(out: &mut String, name: &str) {
    let mut chars = name.chars();
    let title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    let _ = write!(out, "# {}\r\n", title);
}

fn pair(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = write!(out, "{}:{}\r\n", key, value);
}

fn dump_server(service: &Service, out: &mut String) {
    pair(out, "version", env!("CARGO_PKG_VERSION"));
    pair(out, "os", std::env::consts::OS);
    pair(out, "arch", std::env::consts::ARCH);
    pair(out, "process_id", std::process::id());
    pair(out, "addr", &service.options().addr);
    pair(out, "uptime_in_seconds", service.uptime().as_secs());
}

fn dump_clients(service: &Service, out: &mut String) {
    pair(out, "connected_clients", service.session_count());
    pair(out, "pubsub_channels", service.pubsub().channel_count());
    pair(out, "pubsub_patterns", service.pubsub().pattern_count());
}

fn dump_memory(_: &Service, out: &mut String) {
    match resident_memory() {
        Some(rss) => {
            pair(out, "used_memory_rss", rss);
            pair(out, "used_memory_rss_human", memory_human(rss));
        }
        None => pair(out, "used_memory_rss", 0),
    }
}

fn dump_keyspace(service: &Service, out: &mut String) {
    match service.store().keyspace_stats() {
        Ok(stats) => {
            for stat in stats {
                let _ = write!(
                    out,
                    "db{}:keys={},expires={}\r\n",
                    stat.db, stat.keys, stat.expires
                );
            }
        }
        Err(e) => warn!(error = %e, "failed to collect keyspace stats"),
    }
}

/// Resident set size in bytes, where the platform exposes it.
fn resident_memory() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * KB)
}

fn memory_human(n: u64) -> String {
    if n > GB {
        format!("{:.3}G", n as f64 / GB as f64)
    } else if n > MB {
        format!("{:.3}M", n as f64 / MB as f64)
    } else if n > KB {
        format!("{:.3}K", n as f64 / KB as f64)
    } else {
        n.to_string()
    }
}
