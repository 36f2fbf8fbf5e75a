//! Owner records for sentinel reclamation.
//!
//! When stale-sentinel reclamation is enabled, rank 0 writes
//! `"<pid> <start_time>\n"` into each sentinel it creates. A waiter that
//! finds a sentinel naming a process which no longer exists on this host
//! may remove it. Peers that only test existence are unaffected.

#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::io::Read;

#[cfg(target_os = "linux")]
use crate::core::Error;
use crate::core::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerRecord {
    pub pid: u32,
    pub start_time: u64,
}

impl OwnerRecord {
    /// The record for the calling process.
    pub fn current() -> Result<Self> {
        let pid = std::process::id();
        Ok(Self {
            pid,
            start_time: proc_start_time(pid)?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{} {}\n", self.pid, self.start_time)
    }

    /// Parse a record; empty or malformed contents yield `None`.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut parts = contents.split_whitespace();
        let pid = parts.next()?.parse::<u32>().ok()?;
        let start_time = parts.next()?.parse::<u64>().ok()?;
        if pid == 0 {
            return None;
        }
        Some(Self { pid, start_time })
    }

    /// Whether the recorded process is still running.
    ///
    /// A reused pid is told apart by its start time.
    pub fn is_alive(&self) -> bool {
        match proc_start_time(self.pid) {
            Ok(start) => start == self.start_time,
            Err(_) => false,
        }
    }
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    let end = contents.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    let after = &contents[end + 1..];
    let mut fields = after.split_whitespace();
    for _ in 0..19 {
        fields.next();
    }
    let start = fields
        .next()
        .ok_or(Error::Corrupt("stat missing starttime"))?;
    start
        .parse::<u64>()
        .map_err(|_| Error::Corrupt("stat starttime invalid"))
}

#[cfg(not(target_os = "linux"))]
fn proc_start_time(_pid: u32) -> Result<u64> {
    // No process table to consult: every owner counts as alive.
    Ok(0)
}
